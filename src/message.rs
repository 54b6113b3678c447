use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::transaction::Transaction;

/// Protocol revision carried in every version handshake.
pub const PROTOCOL_VERSION: i32 = 1;

/// Every command a peer can send. The serialized variant tag is the wire
/// command; anything that fails to decode into this enum is an unknown
/// command and is dropped with a warning at the transport layer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Message {
    Version(Versionmsg),
    GetBlocks,
    Inv(Invmsg),
    GetData(GetDatamsg),
    Block(Blockmsg),
    Tx(Txmsg),
}

/// What an `Inv`/`GetData` refers to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Block,
    Tx,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Versionmsg {
    pub version: i32,
    pub best_height: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Invmsg {
    pub kind: DataKind,
    pub items: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetDatamsg {
    pub kind: DataKind,
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Blockmsg {
    pub block: Block,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Txmsg {
    pub transaction: Transaction,
}

/// Transport-level acknowledgement completing a request/response exchange.
/// Not a protocol command.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Ack;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let msg = Message::Inv(Invmsg {
            kind: DataKind::Block,
            items: vec![String::from("aa"), String::from("bb")],
        });
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: Message = bincode::deserialize(&bytes).unwrap();
        match decoded {
            Message::Inv(inv) => {
                assert_eq!(inv.kind, DataKind::Block);
                assert_eq!(inv.items, vec!["aa", "bb"]);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command_fails_decode() {
        // a tag past the last variant must not decode into a command
        let bogus = bincode::serialize(&42u32).unwrap();
        assert!(bincode::deserialize::<Message>(&bogus).is_err());
    }
}
