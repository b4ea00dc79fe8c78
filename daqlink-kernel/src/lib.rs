/*!
# DAQLink Kernel

Serveur central : sessions TCP des machines, agrégation minute/heure/jour/
mois/année, persistance, notifications d'anomalies, diffusion live aux
viewers et API historique.
*/

pub mod channels;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod health;
pub mod http;
pub mod listener;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod relay;
pub mod stat;
