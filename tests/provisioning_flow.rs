mod common;

use common::*;
use fleetprov::provisioning::{
    CodecError, ConnectError, Outcome, PayloadCodec, PayloadFormat, ProvisioningError,
    ProvisioningState, StandardCodec, StepError, StepKind, StrayPublishPolicy, TopicSet,
};
use fleetprov::transport::EngineError;
use minicbor::Decoder;

fn csr_topics() -> TopicSet {
    TopicSet::create_certificate_from_csr(PayloadFormat::Cbor)
}

fn register_topics() -> TopicSet {
    TopicSet::register_thing(TEMPLATE, PayloadFormat::Cbor)
}

fn script_success(broker: &FakeBroker, pem: &str, id: &str, token: &str, thing: &str) {
    let csr = csr_topics();
    let register = register_topics();
    broker.reply_to(&csr.publish, vec![publish(&csr.accepted, csr_accepted(pem, id, token))]);
    broker.reply_to(
        &register.publish,
        vec![publish(&register.accepted, register_accepted(thing))],
    );
}

#[tokio::test]
async fn cbor_csr_round_trip_threads_credential_into_register() {
    let broker = FakeBroker::new();
    let keystore = MemoryKeyStore::default();
    let clock = RecordingClock::default();
    let pem = pem_of_len(1024);
    let token = "t".repeat(64);
    script_success(&broker, &pem, "abc123", &token, "thing-42");

    let mut prov = provisioner(
        &broker,
        keystore.clone(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    prov.run().await.unwrap();

    let certs = keystore.certificates();
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0].0.label(), "device");
    assert_eq!(certs[0].2, pem);
    assert_eq!(certs[0].2.len(), 1024);

    let requests = broker.published_to(&register_topics().publish);
    assert_eq!(requests.len(), 1);
    let mut dec = Decoder::new(&requests[0]);
    assert_eq!(dec.map().unwrap(), Some(2));
    assert_eq!(dec.str().unwrap(), "certificateOwnershipToken");
    assert_eq!(dec.str().unwrap(), token);
    assert_eq!(dec.str().unwrap(), "parameters");
    assert_eq!(dec.map().unwrap(), Some(1));
    assert_eq!(dec.str().unwrap(), "SerialNumber");
    assert_eq!(dec.str().unwrap(), CLIENT_ID);

    let identities = keystore.identities();
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].certificate_id, "abc123");
    assert_eq!(identities[0].template, TEMPLATE);
}

#[tokio::test]
async fn csr_request_carries_generated_csr() {
    let broker = FakeBroker::new();
    let keystore = MemoryKeyStore::default();
    let clock = RecordingClock::default();
    script_success(&broker, &pem_of_len(300), "id", "tok", "thing-1");

    let mut prov = provisioner(
        &broker,
        keystore.clone(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    prov.run().await.unwrap();

    let generated = keystore.0.lock().unwrap().generated.clone();
    assert_eq!(generated, vec![("device".to_string(), CLIENT_ID.to_string())]);
    let requests = broker.published_to(&csr_topics().publish);
    let mut dec = Decoder::new(&requests[0]);
    assert_eq!(dec.map().unwrap(), Some(1));
    assert_eq!(dec.str().unwrap(), "certificateSigningRequest");
    assert!(dec.str().unwrap().contains(CLIENT_ID));
}

#[tokio::test]
async fn end_to_end_reaches_done_with_full_history() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    script_success(&broker, &pem_of_len(512), "cert-1", "tok", "thing-42");

    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    let identity = prov.run().await.unwrap();
    assert_eq!(identity.thing_name, "thing-42");
    assert_eq!(prov.state(), ProvisioningState::Done);
    assert_eq!(
        prov.history(),
        &[
            ProvisioningState::Init,
            ProvisioningState::Connected,
            ProvisioningState::CsrSubscribed,
            ProvisioningState::CsrPublished,
            ProvisioningState::CsrResult(Outcome::Accepted),
            ProvisioningState::CsrUnsubscribed,
            ProvisioningState::RegisterSubscribed,
            ProvisioningState::RegisterPublished,
            ProvisioningState::RegisterResult(Outcome::Accepted),
            ProvisioningState::RegisterUnsubscribed,
            ProvisioningState::Disconnected,
            ProvisioningState::Done,
        ]
    );
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn steps_never_overlap_on_the_wire() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    script_success(&broker, &pem_of_len(512), "cert-1", "tok", "thing-42");
    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    prov.run().await.unwrap();

    let csr = csr_topics();
    let register = register_topics();
    // Payloads are checked elsewhere; only the topic sequence matters here.
    let ops: Vec<Op> = broker
        .ops()
        .into_iter()
        .map(|op| match op {
            Op::Publish(topic, _) => Op::Publish(topic, Vec::new()),
            other => other,
        })
        .collect();
    let expected = vec![
        Op::Connect(CLIENT_ID.to_string()),
        Op::Subscribe(vec![csr.accepted.clone(), csr.rejected.clone()]),
        Op::Publish(csr.publish.clone(), Vec::new()),
        Op::Unsubscribe(csr.accepted.clone()),
        Op::Unsubscribe(csr.rejected.clone()),
        Op::Subscribe(vec![register.accepted.clone(), register.rejected.clone()]),
        Op::Publish(register.publish.clone(), Vec::new()),
        Op::Unsubscribe(register.accepted.clone()),
        Op::Unsubscribe(register.rejected.clone()),
        Op::Disconnect,
    ];
    assert_eq!(ops, expected);
}

#[tokio::test]
async fn csr_rejection_stops_before_register() {
    let broker = FakeBroker::new();
    let keystore = MemoryKeyStore::default();
    let clock = RecordingClock::default();
    let csr = csr_topics();
    broker.reply_to(
        &csr.publish,
        vec![publish(&csr.rejected, rejected(400, "InvalidPayload", "csr malformed"))],
    );

    let mut prov = provisioner(
        &broker,
        keystore.clone(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    let err = prov.run().await.unwrap_err();
    match err {
        ProvisioningError::Step(StepError::ServerRejected { step, detail }) => {
            assert_eq!(step, StepKind::CreateCertificateFromCsr);
            assert_eq!(detail.status_code, Some(400));
            assert_eq!(detail.error_code.as_deref(), Some("InvalidPayload"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(keystore.certificates().is_empty());
    assert!(broker.published_to(&register_topics().publish).is_empty());
    assert_eq!(broker.count(|op| matches!(op, Op::Unsubscribe(_))), 2);
    assert_eq!(broker.count(|op| matches!(op, Op::Disconnect)), 1);
    assert_eq!(
        prov.history().last(),
        Some(&ProvisioningState::Failed)
    );
    assert!(prov
        .history()
        .contains(&ProvisioningState::CsrResult(Outcome::Rejected)));
}

#[tokio::test]
async fn register_rejection_keeps_certificate_but_fails() {
    let broker = FakeBroker::new();
    let keystore = MemoryKeyStore::default();
    let clock = RecordingClock::default();
    let csr = csr_topics();
    let register = register_topics();
    broker.reply_to(
        &csr.publish,
        vec![publish(&csr.accepted, csr_accepted(&pem_of_len(400), "id", "tok"))],
    );
    broker.reply_to(
        &register.publish,
        vec![publish(&register.rejected, rejected(403, "Forbidden", "template denied"))],
    );

    let mut prov = provisioner(
        &broker,
        keystore.clone(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    let err = prov.run().await.unwrap_err();
    assert!(matches!(
        err,
        ProvisioningError::Step(StepError::ServerRejected {
            step: StepKind::RegisterThing,
            ..
        })
    ));
    assert_eq!(keystore.certificates().len(), 1);
    assert!(keystore.identities().is_empty());
    assert!(prov
        .history()
        .contains(&ProvisioningState::RegisterResult(Outcome::Rejected)));
}

#[tokio::test]
async fn silence_times_out_and_still_tears_down() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(5, StrayPublishPolicy::Tolerate),
    );
    let err = prov.run().await.unwrap_err();
    assert!(matches!(
        err,
        ProvisioningError::Step(StepError::NoResponse {
            step: StepKind::CreateCertificateFromCsr,
            polls: 5
        })
    ));
    // SUBACK, five response polls, two UNSUBACKs.
    assert_eq!(broker.polls(), 1 + 5 + 2);
    assert_eq!(broker.count(|op| matches!(op, Op::Unsubscribe(_))), 2);
    assert_eq!(broker.count(|op| matches!(op, Op::Disconnect)), 1);
    assert_eq!(prov.state(), ProvisioningState::Failed);
}

#[tokio::test]
async fn stray_publish_is_tolerated_within_budget() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    let csr = csr_topics();
    let register = register_topics();
    broker.reply_to(
        &csr.publish,
        vec![
            publish("devices/other/notice", b"hello".to_vec()),
            publish(&register.accepted, register_accepted("early")),
            publish(&csr.accepted, csr_accepted(&pem_of_len(300), "id", "tok")),
        ],
    );
    broker.reply_to(
        &register.publish,
        vec![publish(&register.accepted, register_accepted("thing-42"))],
    );

    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    let identity = prov.run().await.unwrap();
    assert_eq!(identity.thing_name, "thing-42");
}

#[tokio::test]
async fn stray_publish_fails_fast_when_rejected_by_policy() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    let csr = csr_topics();
    broker.reply_to(
        &csr.publish,
        vec![
            publish("devices/other/notice", b"hello".to_vec()),
            publish(&csr.accepted, csr_accepted(&pem_of_len(300), "id", "tok")),
        ],
    );

    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(10, StrayPublishPolicy::Reject),
    );
    match prov.run().await.unwrap_err() {
        ProvisioningError::Step(StepError::UnexpectedResponse { step, topic }) => {
            assert_eq!(step, StepKind::CreateCertificateFromCsr);
            assert_eq!(topic, "devices/other/notice");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn stray_publishes_consume_the_shared_budget() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    let csr = csr_topics();
    // PUBACK plus three strays exhaust a four-poll budget before the answer.
    broker.reply_to(
        &csr.publish,
        vec![
            publish("a/1", vec![]),
            publish("a/2", vec![]),
            publish("a/3", vec![]),
            publish(&csr.accepted, csr_accepted(&pem_of_len(300), "id", "tok")),
        ],
    );
    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(4, StrayPublishPolicy::Tolerate),
    );
    assert!(matches!(
        prov.run().await.unwrap_err(),
        ProvisioningError::Step(StepError::NoResponse { polls: 4, .. })
    ));
}

#[tokio::test]
async fn refused_suback_is_retried_with_backoff() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    broker.refuse_subacks(2);
    script_success(&broker, &pem_of_len(300), "id", "tok", "thing-42");

    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    prov.run().await.unwrap();

    let csr = csr_topics();
    let csr_subscribes = broker.count(|op| {
        matches!(op, Op::Subscribe(filters) if filters[0] == csr.accepted)
    });
    assert_eq!(csr_subscribes, 3);
    let sleeps = clock.sleeps();
    assert_eq!(sleeps.len(), 2);
    assert!(sleeps[0].as_millis() <= 500);
    assert!(sleeps[1].as_millis() <= 1_000);
    // The CSR was published exactly once.
    assert_eq!(broker.published_to(&csr.publish).len(), 1);
}

#[tokio::test]
async fn subscribe_gives_up_after_max_attempts() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    broker.refuse_subacks(100);

    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    match prov.run().await.unwrap_err() {
        ProvisioningError::Step(StepError::SubscribeFailed { attempts, .. }) => {
            assert_eq!(attempts, 5);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(broker.count(|op| matches!(op, Op::Subscribe(_))), 5);
    assert_eq!(clock.sleeps().len(), 4);
    assert!(broker.published_to(&csr_topics().publish).is_empty());
    assert_eq!(broker.count(|op| matches!(op, Op::Disconnect)), 1);
}

#[tokio::test]
async fn oversized_response_is_fatal() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    let csr = csr_topics();
    broker.reply_to(
        &csr.publish,
        vec![publish(&csr.accepted, vec![0u8; 4096])],
    );
    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    assert!(matches!(
        prov.run().await.unwrap_err(),
        ProvisioningError::Step(StepError::PayloadTooLarge(_))
    ));
}

#[tokio::test]
async fn over_limit_certificate_id_fails_decode() {
    let broker = FakeBroker::new();
    let keystore = MemoryKeyStore::default();
    let clock = RecordingClock::default();
    let csr = csr_topics();
    broker.reply_to(
        &csr.publish,
        vec![publish(
            &csr.accepted,
            csr_accepted(&pem_of_len(300), &"x".repeat(65), "tok"),
        )],
    );
    let mut prov = provisioner(
        &broker,
        keystore.clone(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    match prov.run().await.unwrap_err() {
        ProvisioningError::Step(StepError::DecodeFailed { step, source }) => {
            assert_eq!(step, StepKind::CreateCertificateFromCsr);
            assert!(matches!(source, CodecError::FieldTooLong { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(keystore.certificates().is_empty());
}

#[tokio::test]
async fn transport_loss_mid_step_aborts_and_tears_down() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    // Poll 1 is the SUBACK, poll 2 the PUBACK, poll 3 fails.
    broker.fail_poll_at(3);
    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    match prov.run().await.unwrap_err() {
        ProvisioningError::Step(StepError::Transport { source, .. }) => {
            assert_eq!(source, EngineError::Transport("connection reset".into()));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(broker.count(|op| matches!(op, Op::Disconnect)), 1);
}

#[tokio::test]
async fn key_generation_failure_never_touches_network() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::failing(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    assert!(matches!(
        prov.run().await.unwrap_err(),
        ProvisioningError::KeyStore(_)
    ));
    assert!(broker.ops().is_empty());
    assert_eq!(
        prov.history(),
        &[ProvisioningState::Init, ProvisioningState::Failed]
    );
}

#[tokio::test]
async fn unreachable_broker_fails_without_disconnect() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    broker.fail_connects(vec![EngineError::Transport("refused".into()); 10]);
    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    assert!(matches!(
        prov.run().await.unwrap_err(),
        ProvisioningError::Connect(ConnectError::Exhausted { attempts: 5, .. })
    ));
    assert_eq!(broker.count(|op| matches!(op, Op::Connect(_))), 5);
    assert_eq!(broker.count(|op| matches!(op, Op::Disconnect)), 0);
}

#[tokio::test]
async fn run_can_restart_from_init() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(3, StrayPublishPolicy::Tolerate),
    );
    assert!(prov.run().await.is_err());

    script_success(&broker, &pem_of_len(300), "id", "tok", "thing-42");
    let identity = prov.run().await.unwrap();
    assert_eq!(identity.thing_name, "thing-42");
    assert_eq!(prov.history().first(), Some(&ProvisioningState::Init));
    assert_eq!(prov.state(), ProvisioningState::Done);
}

#[test]
fn codec_used_by_flow_decodes_helper_payloads() {
    let codec = StandardCodec::default();
    let identity = codec
        .decode_register_response(&register_accepted("thing-42"))
        .unwrap();
    assert_eq!(identity.thing_name, "thing-42");
}

#[tokio::test]
async fn failed_disconnect_after_success_is_still_recorded() {
    let broker = FakeBroker::new();
    let clock = RecordingClock::default();
    broker.fail_disconnect();
    script_success(&broker, &pem_of_len(300), "id", "tok", "thing-42");

    let mut prov = provisioner(
        &broker,
        MemoryKeyStore::default(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    prov.run().await.unwrap();
    let tail = &prov.history()[prov.history().len() - 3..];
    assert_eq!(
        tail,
        &[
            ProvisioningState::RegisterUnsubscribed,
            ProvisioningState::Disconnected,
            ProvisioningState::Done,
        ]
    );
    assert_eq!(broker.count(|op| matches!(op, Op::Disconnect)), 1);
}

#[tokio::test]
async fn identity_record_is_stamped_by_the_clock() {
    let broker = FakeBroker::new();
    let keystore = MemoryKeyStore::default();
    let clock = RecordingClock::default();
    script_success(&broker, &pem_of_len(300), "id", "tok", "thing-42");

    let mut prov = provisioner(
        &broker,
        keystore.clone(),
        &clock,
        test_plan(10, StrayPublishPolicy::Tolerate),
    );
    prov.run().await.unwrap();
    let identities = keystore.identities();
    assert_eq!(identities[0].provisioned_at, fixed_wall_time());
    assert_eq!(identities[0].thing_name, "thing-42");
}
