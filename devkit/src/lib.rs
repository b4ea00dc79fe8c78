/*!
# DAQLink DevKit - Outils de test pour machines et kernel

Bibliothèque facilitant les tests du protocole machine avec:
- MockMachine : producteur TCP parlant le protocole filaire
- RecordingServer : faux kernel qui enregistre les frames reçues
- Builders de frames (valides, corrompues, tronquées)
- Helpers d'attente et de logging pour tests async
*/

pub mod frames;
pub mod mock_machine;
pub mod recording_server;
pub mod test_utils;

pub use frames::FrameBuilder;
pub use mock_machine::MockMachine;
pub use recording_server::{RecordedFrame, RecordingServer};
pub use test_utils::{init_logging, recv_within, wait_until, Inbox};
