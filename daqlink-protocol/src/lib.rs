/*!
# DAQLink Protocol - machine ↔ kernel wire format

Shared by the kernel listener and every machine agent:
- `Message` = the `(event, payload)` pairs exchanged on the wire
- `codec` = length-prefixed framing with a JSON payload
- `keepalive` = TCP keepalive tuning applied on both ends
*/

pub mod codec;
pub mod keepalive;
pub mod message;

pub use codec::{decode, encode, CodecError, MachineCodec, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};
pub use keepalive::{enable_keepalive, KEEPALIVE_COUNT, KEEPALIVE_IDLE_SECS, KEEPALIVE_INTERVAL_SECS};
pub use message::{
    FaultReport, MachineEvent, Message, SensorBatch, SensorData, DATA_UPDATE_EVENT, FAULT_DETECT_EVENT,
    HANDSHAKE_EVENT,
};
