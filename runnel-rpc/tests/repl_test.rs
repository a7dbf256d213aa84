//! Replication and forwarding tests over real loopback gRPC.

mod common;

use common::{connect, event, start_cluster, stream_id, SEAL_SIZE};
use runnel_proto::v1::{
    AddEventRequest, CreateStreamRequest, GetMiniblocksRequest, GetStreamExRequest,
    GetStreamRequest,
};
use std::time::Duration;
use tonic::Code;

#[tokio::test]
async fn create_replicates_to_every_replica() {
    let cluster = start_cluster(3, 2).await;
    let id = stream_id(0); // replicas: nodes 1 and 2

    cluster.nodes[0]
        .client()
        .await
        .create_stream(CreateStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            events: vec![event(1)],
        })
        .await
        .expect("create stream");

    for node in &cluster.nodes[..2] {
        let response = node
            .client()
            .await
            .get_stream(GetStreamRequest {
                stream_id: id.as_bytes().to_vec(),
                optional: false,
            })
            .await
            .expect("get stream")
            .into_inner();
        assert_eq!(response.stream.expect("stream").miniblocks.len(), 1);
    }
}

#[tokio::test]
async fn quorum_write_tolerates_a_minority_of_dead_replicas() {
    let cluster = start_cluster(3, 3).await;
    let id = stream_id(0); // all three nodes are replicas

    cluster.nodes[2].shut_down();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Local + node 2 acknowledge: 2 of 3, majority holds.
    cluster.nodes[0]
        .client()
        .await
        .create_stream(CreateStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            events: vec![event(1)],
        })
        .await
        .expect("create must survive one dead replica");

    let response = cluster.nodes[1]
        .client()
        .await
        .get_stream(GetStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            optional: false,
        })
        .await
        .expect("get stream")
        .into_inner();
    assert_eq!(response.stream.expect("stream").miniblocks.len(), 1);
}

#[tokio::test]
async fn quorum_write_fails_when_majority_is_unreachable() {
    let cluster = start_cluster(3, 3).await;
    let id = stream_id(0);

    cluster.nodes[1].shut_down();
    cluster.nodes[2].shut_down();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = cluster.nodes[0]
        .client()
        .await
        .create_stream(CreateStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            events: vec![event(1)],
        })
        .await
        .expect_err("one of three replicas is not a quorum");
    assert_eq!(err.code(), Code::Unavailable);
}

#[tokio::test]
async fn reads_and_writes_forward_from_non_replicas() {
    let cluster = start_cluster(3, 2).await;
    let id = stream_id(0); // node 3 is not a replica

    cluster.nodes[0]
        .client()
        .await
        .create_stream(CreateStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            events: vec![event(1)],
        })
        .await
        .expect("create stream");

    let mut outsider = cluster.nodes[2].client().await;

    let response = outsider
        .get_stream(GetStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            optional: false,
        })
        .await
        .expect("forwarded get")
        .into_inner();
    assert_eq!(response.stream.expect("stream").miniblocks.len(), 1);

    outsider
        .add_event(AddEventRequest {
            stream_id: id.as_bytes().to_vec(),
            event: Some(event(2)),
        })
        .await
        .expect("forwarded add_event");

    // The relayed write must be quorum-committed on the replicas.
    let response = cluster.nodes[0]
        .client()
        .await
        .get_stream(GetStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            optional: false,
        })
        .await
        .expect("get stream")
        .into_inner();
    assert_eq!(response.stream.expect("stream").events.len(), 1);

    let blocks = outsider
        .get_miniblocks(GetMiniblocksRequest {
            stream_id: id.as_bytes().to_vec(),
            from_inclusive: 0,
            to_exclusive: -1,
        })
        .await
        .expect("forwarded get_miniblocks")
        .into_inner();
    assert_eq!(blocks.miniblocks.len(), 1);
}

#[tokio::test]
async fn unknown_stream_is_not_found_not_retried() {
    let cluster = start_cluster(3, 2).await;
    let id = stream_id(0);

    let err = cluster.nodes[2]
        .client()
        .await
        .get_stream(GetStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            optional: false,
        })
        .await
        .expect_err("stream was never created");
    assert_eq!(err.code(), Code::NotFound);

    let response = cluster.nodes[2]
        .client()
        .await
        .get_stream(GetStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            optional: true,
        })
        .await
        .expect("optional get")
        .into_inner();
    assert!(response.stream.is_none());
}

#[tokio::test]
async fn minipool_seals_into_a_replicated_miniblock() {
    let cluster = start_cluster(3, 2).await;
    let id = stream_id(0);

    let mut owner = cluster.nodes[0].client().await;
    owner
        .create_stream(CreateStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            events: vec![event(0)],
        })
        .await
        .expect("create stream");

    for n in 0..SEAL_SIZE as u8 {
        owner
            .add_event(AddEventRequest {
                stream_id: id.as_bytes().to_vec(),
                event: Some(event(n + 1)),
            })
            .await
            .expect("add event");
    }

    // Sealing runs in the background on the hosting node; poll the
    // other replica until the candidate lands there too.
    let mut replica = cluster.nodes[1].client().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let blocks = replica
            .get_miniblocks(GetMiniblocksRequest {
                stream_id: id.as_bytes().to_vec(),
                from_inclusive: 0,
                to_exclusive: -1,
            })
            .await
            .expect("get miniblocks")
            .into_inner();
        if blocks.miniblocks.len() == 2 {
            assert_eq!(blocks.miniblocks[1].events.len(), SEAL_SIZE);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "miniblock never sealed on the replica"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn get_stream_ex_streams_blocks_with_terminator() {
    let cluster = start_cluster(3, 2).await;
    let id = stream_id(0);

    cluster.nodes[0]
        .client()
        .await
        .create_stream(CreateStreamRequest {
            stream_id: id.as_bytes().to_vec(),
            events: vec![event(1)],
        })
        .await
        .expect("create stream");

    // Through a non-replica, so the response is relayed peer-to-peer.
    let mut stream = connect(cluster.nodes[2].rpc_addr)
        .await
        .get_stream_ex(GetStreamExRequest {
            stream_id: id.as_bytes().to_vec(),
        })
        .await
        .expect("get_stream_ex")
        .into_inner();

    let mut blocks = 0;
    let mut saw_terminator = false;
    while let Some(packet) = tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("timed out")
        .expect("stream errored")
    {
        if packet.data.is_some() {
            blocks += 1;
        } else {
            saw_terminator = true;
        }
    }
    assert_eq!(blocks, 1);
    assert!(saw_terminator, "missing empty terminator packet");
}
