//! Generated protobuf definitions for runnel

pub mod v1 {
    tonic::include_proto!("runnel.v1");

    use runnel_model::{EventRecord, MiniblockRecord, NodeAddress, StreamId};

    impl From<EventRecord> for Envelope {
        fn from(record: EventRecord) -> Self {
            Envelope {
                hash: record.hash,
                payload: record.payload,
            }
        }
    }

    impl From<Envelope> for EventRecord {
        fn from(proto: Envelope) -> Self {
            EventRecord {
                hash: proto.hash,
                payload: proto.payload,
            }
        }
    }

    impl From<MiniblockRecord> for Miniblock {
        fn from(record: MiniblockRecord) -> Self {
            Miniblock {
                num: record.num,
                header_hash: record.header_hash,
                events: record.events.into_iter().map(Envelope::from).collect(),
            }
        }
    }

    impl From<Miniblock> for MiniblockRecord {
        fn from(proto: Miniblock) -> Self {
            MiniblockRecord {
                num: proto.num,
                header_hash: proto.header_hash,
                events: proto.events.into_iter().map(EventRecord::from).collect(),
            }
        }
    }

    impl SyncCookie {
        /// Parse and validate the stream id carried by this cookie.
        pub fn stream_id(&self) -> Result<StreamId, String> {
            StreamId::try_from(self.stream_id.as_slice())
                .map_err(|_| format!("invalid stream id length: {}", self.stream_id.len()))
        }

        /// Parse and validate the node address carried by this cookie.
        pub fn node_address(&self) -> Result<NodeAddress, String> {
            NodeAddress::try_from(self.node_address.as_slice())
                .map_err(|_| format!("invalid node address length: {}", self.node_address.len()))
        }
    }

}
