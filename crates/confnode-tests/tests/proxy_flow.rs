//! A proxy node forwarding to a worker node, with the test playing the
//! routing layer between them.

use confnode_job::{DaemonMessage, JobMessage, Parameters, Role, WorkerAttestation, WorkerClose};
use confnode_proto::app::v1::response_message::Kind;
use confnode_proto::app::v1::{ExecutionLogEntry, ResponseStatus, ResponseSummary};
use confnode_tests::harness::client::{REQUEST_ID, TestClient};
use confnode_tests::harness::init_tracing;
use confnode_tests::harness::node::{RELEASE, TestNode, issuer};
use confnode_tests::harness::stream::JobStream;
use confnode_tests::harness::workload::TestWorkload;
use confnode_workload::protocol::{AppMessage, NodeMessage};
use prost::Message;

fn summary(status: ResponseStatus) -> Kind {
    Kind::Summary(ResponseSummary {
        status: status.into(),
    })
}

fn find_worker(worker_id: &str) -> AppMessage {
    AppMessage::FindWorker {
        worker_id: worker_id.to_string(),
        service_name: "inference".to_string(),
        routing_parameters: [("model".to_string(), "small".to_string())].into(),
        response_bypass: false,
        is_final: true,
    }
}

struct Proxied {
    client: TestClient,
    job: JobStream,
    workload: TestWorkload,
}

/// Authenticate a request to the proxy and have its workload ask for `w1`.
async fn proxied_request(proxy: &TestNode, issuer: &confnode_crypto::token::TokenIssuer) -> Proxied {
    let mut client = TestClient::new(&proxy.public_key, proxy.key_id);
    let mut job = proxy.start_job().await.unwrap();
    let mut workload = proxy.accept_job().await.unwrap();

    job.send(client.parameters()).await;
    job.send(client.auth_token(issuer)).await;
    job.send(client.payload(b"question", true)).await;
    assert!(matches!(workload.recv().await, NodeMessage::Parameters { .. }));
    assert_eq!(
        workload.recv().await,
        NodeMessage::Chunk {
            data: b"question".to_vec(),
            is_final: true
        }
    );
    let Some(JobMessage::ResponseChunk {
        encrypted_payload,
        is_final,
    }) = job.next().await
    else {
        panic!("expected the response uuid");
    };
    assert!(matches!(
        client.open_chunk(&encrypted_payload, is_final)[..],
        [Kind::ResponseUuid(_)]
    ));

    workload.send(find_worker("w1")).await;
    let Some(JobMessage::FindWorker(query)) = job.next().await else {
        panic!("expected FindWorker");
    };
    assert_eq!(query.worker_id, "w1");
    assert_eq!(query.service_name, "inference");
    assert_eq!(
        query.routing_parameters.get("model").map(String::as_str),
        Some("small")
    );

    Proxied {
        client,
        job,
        workload,
    }
}

#[tokio::test]
async fn proxy_forwards_to_an_attested_worker() {
    init_tracing();
    let issuer = issuer();
    let proxy = TestNode::spawn(Role::Proxy, &issuer).await.unwrap();
    let worker = TestNode::spawn(Role::Worker, &issuer).await.unwrap();
    let Proxied {
        mut client,
        mut job,
        mut workload,
    } = proxied_request(&proxy, &issuer).await;

    let bundle = worker.attestation_bundle(RELEASE).encode_to_vec();
    job.send(DaemonMessage::WorkerAttestation(WorkerAttestation {
        worker_id: "w1".to_string(),
        attestation_bundle: bundle.clone(),
        response_bypass_context_id: None,
    }))
    .await;

    // The client learns which worker it is talking to before the worker can
    // read anything.
    let Some(JobMessage::ResponseChunk {
        encrypted_payload,
        is_final,
    }) = job.next().await
    else {
        panic!("expected the execution log entry");
    };
    assert_eq!(
        client.open_chunk(&encrypted_payload, is_final),
        [Kind::ExecutionLogEntry(ExecutionLogEntry {
            attestation: Some(bundle),
            response_bypass: None,
            is_final: true,
        })]
    );
    let Some(JobMessage::WorkerDecryptionKey {
        worker_id,
        key_id,
        encapsulated_key,
    }) = job.next().await
    else {
        panic!("expected the worker key");
    };
    assert_eq!(worker_id, "w1");
    assert_eq!(key_id, worker.key_id);

    let mut downstream = worker.start_job().await.unwrap();
    let mut worker_workload = worker.accept_job().await.unwrap();
    downstream
        .send(DaemonMessage::Parameters(Parameters {
            request_id: REQUEST_ID.to_string(),
            one_time_token: client.one_time_token(),
            encapsulated_key,
            ..Default::default()
        }))
        .await;
    assert_eq!(
        workload.recv().await,
        NodeMessage::WorkerFound {
            worker_id: "w1".to_string()
        }
    );

    workload
        .send(AppMessage::WorkerRequest {
            worker_id: "w1".to_string(),
            data: b"sub-question".to_vec(),
            is_final: true,
        })
        .await;
    workload
        .send(AppMessage::WorkerEof {
            worker_id: "w1".to_string(),
        })
        .await;

    // Relay the proxy's requests: its own credential first, then the data.
    loop {
        match job.next().await {
            Some(JobMessage::WorkerRequestMessage {
                message, is_final, ..
            }) => {
                downstream
                    .send(DaemonMessage::RequestChunk {
                        encrypted_payload: message,
                        is_final,
                    })
                    .await
            }
            Some(JobMessage::WorkerRequestEof { worker_id }) => {
                assert_eq!(worker_id, "w1");
                break;
            }
            other => panic!("unexpected proxy output {other:?}"),
        }
    }

    assert!(matches!(
        worker_workload.recv().await,
        NodeMessage::Parameters { .. }
    ));
    assert_eq!(
        worker_workload.recv().await,
        NodeMessage::Chunk {
            data: b"sub-question".to_vec(),
            is_final: true
        }
    );
    worker_workload.respond(b"sub-answer").await;

    for message in downstream.drain().await {
        if let JobMessage::ResponseChunk {
            encrypted_payload,
            is_final,
        } = message
        {
            job.send(DaemonMessage::WorkerResponseChunk {
                worker_id: "w1".to_string(),
                chunk: encrypted_payload,
                is_final,
            })
            .await;
        }
    }
    job.send(DaemonMessage::WorkerResponseEof {
        worker_id: "w1".to_string(),
    })
    .await;

    assert_eq!(
        workload.recv().await,
        NodeMessage::WorkerResponse {
            worker_id: "w1".to_string(),
            data: b"sub-answer".to_vec(),
            is_final: false,
            status: None,
        }
    );
    assert_eq!(
        workload.recv().await,
        NodeMessage::WorkerResponse {
            worker_id: "w1".to_string(),
            data: Vec::new(),
            is_final: true,
            status: Some("RESPONSE_STATUS_OK".to_string()),
        }
    );
    assert_eq!(
        workload.recv().await,
        NodeMessage::WorkerEof {
            worker_id: "w1".to_string()
        }
    );

    workload.respond(b"answer").await;
    let out = job.drain().await;
    assert_eq!(
        client.open(&out),
        [Kind::Payload(b"answer".to_vec()), summary(ResponseStatus::Ok)]
    );
}

#[tokio::test]
async fn worker_on_another_release_never_gets_the_key() {
    init_tracing();
    let issuer = issuer();
    let proxy = TestNode::spawn(Role::Proxy, &issuer).await.unwrap();
    let worker = TestNode::spawn(Role::Worker, &issuer).await.unwrap();
    let Proxied {
        mut client,
        mut job,
        mut workload,
    } = proxied_request(&proxy, &issuer).await;

    job.send(DaemonMessage::WorkerAttestation(WorkerAttestation {
        worker_id: "w1".to_string(),
        attestation_bundle: worker
            .attestation_bundle("sha256:someone-else")
            .encode_to_vec(),
        response_bypass_context_id: None,
    }))
    .await;

    let out = job.drain().await;
    assert!(
        !out.iter()
            .any(|m| matches!(m, JobMessage::WorkerDecryptionKey { .. }))
    );
    assert_eq!(
        client.open(&out),
        [summary(ResponseStatus::ProxyWorkerValidationError)]
    );
    assert_eq!(workload.recv_until_closed().await, [NodeMessage::Abandon]);
}

#[tokio::test]
async fn routing_failure_is_reported_to_the_client() {
    init_tracing();
    let issuer = issuer();
    let proxy = TestNode::spawn(Role::Proxy, &issuer).await.unwrap();
    let Proxied {
        mut client,
        mut job,
        workload: _workload,
    } = proxied_request(&proxy, &issuer).await;

    job.send(DaemonMessage::WorkerResponseClose(WorkerClose {
        worker_id: "w1".to_string(),
        grpc_status: 14,
        grpc_message: Some("unavailable".to_string()),
        ropes_error_code: Some(3),
        ropes_message: Some("no workers for inference".to_string()),
    }))
    .await;

    let out = job.drain().await;
    assert_eq!(
        client.open(&out),
        [summary(ResponseStatus::ProxyFindWorkerError)]
    );
}
