/*!
Builders de frames pour les tests

Messages typés pour le cas nominal, octets bruts pour les cas d'erreur
(payload illisible, frame tronquée, préfixe hors limite).
*/

use daqlink_protocol::{encode, FaultReport, Message, SensorBatch, SensorData, LENGTH_PREFIX_LEN};
use serde_json::Value;

pub struct FrameBuilder;

impl FrameBuilder {
    /// Handshake `name`
    pub fn name(machine: &str) -> Message {
        Message::Name(machine.to_string())
    }

    /// DataUpdate à partir de `(capteur, type, échantillons)`
    pub fn data_update(sensors: &[(&str, &str, &[f64])]) -> Message {
        let data: SensorData = sensors
            .iter()
            .map(|(name, kind, samples)| (name.to_string(), SensorBatch::new(*kind, samples.to_vec())))
            .collect();
        Message::DataUpdate(data)
    }

    pub fn fault(score: f64, threshold: f64) -> Message {
        Message::FaultDetect(FaultReport { score, threshold })
    }

    /// Frame complète autour d'un payload arbitraire
    pub fn raw(payload: &[u8]) -> Vec<u8> {
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    /// Frame autour d'une valeur JSON libre (événement inconnu, champs manquants...)
    pub fn json(value: &Value) -> anyhow::Result<Vec<u8>> {
        Ok(Self::raw(&serde_json::to_vec(value)?))
    }

    /// Frame valide amputée de ses derniers octets
    pub fn truncated(message: &Message, missing: usize) -> anyhow::Result<Vec<u8>> {
        let mut frame = encode(message)?;
        let keep = frame.len().saturating_sub(missing).max(LENGTH_PREFIX_LEN.min(frame.len()));
        frame.truncate(keep);
        Ok(frame)
    }

    /// Préfixe annonçant `len` octets, sans payload
    pub fn prefix_only(len: u32) -> Vec<u8> {
        len.to_be_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daqlink_protocol::{decode, CodecError};

    #[test]
    fn builders_produce_decodable_frames() {
        let msg = FrameBuilder::data_update(&[("temp", "TEMP", &[1.0, 2.0])]);
        let (decoded, used) = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(used > LENGTH_PREFIX_LEN);
    }

    #[test]
    fn raw_garbage_is_a_decode_error() {
        let frame = FrameBuilder::raw(b"not json");
        assert!(matches!(decode(&frame), Err(CodecError::Decode(_))));
    }

    #[test]
    fn truncated_frame_is_incomplete() {
        let frame = FrameBuilder::truncated(&FrameBuilder::name("M1"), 3).unwrap();
        assert!(matches!(decode(&frame), Err(CodecError::Incomplete { .. })));
    }
}
