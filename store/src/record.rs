//! The serialized value stored under each revision key in the `key` bucket.

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

/// The record persisted under a revision key. `modify_rev` is deliberately
/// absent: it's implicit in the revision key itself, so storing it again
/// would just be one more place for recovery to disagree with the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_main: i64,
    pub version: u64,
    /// 0 means no lease attached.
    pub lease: u64,
}

impl Record {
    pub fn encode(&self) -> CResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_bincode() {
        let record = Record {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            create_main: 7,
            version: 3,
            lease: 0,
        };
        let decoded = Record::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }
}
