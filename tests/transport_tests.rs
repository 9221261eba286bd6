// Transport seam: async-snmp value/error mapping, session setup, and the scripted mock

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use async_snmp::{Auth, ErrorStatus, Oid, Value, VarBind};
use bytes::Bytes;
use common::device;
use ifcollector::error::TransportError;
use ifcollector::models::{Credentials, RawValue};
use ifcollector::transport::snmp::{
    auth_for, in_request_order, raw_value, target_address, transport_error,
};
use ifcollector::transport::{AsyncSnmpTransport, MockTransport, SnmpTransport};

fn oids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn oid(s: &str) -> Oid {
    Oid::parse(s).unwrap()
}

fn agent() -> SocketAddr {
    "10.0.0.1:161".parse().unwrap()
}

#[test]
fn targets_get_the_default_port_only_when_missing() {
    assert_eq!(target_address("sw1.lab", 161), "sw1.lab:161");
    assert_eq!(target_address("sw1.lab:1161", 161), "sw1.lab:1161");
    assert_eq!(target_address("10.0.0.1", 161), "10.0.0.1:161");
    assert_eq!(target_address("10.0.0.1:1161", 161), "10.0.0.1:1161");
    assert_eq!(target_address("fe80::1", 161), "[fe80::1]:161");
    assert_eq!(target_address("[fe80::1]:1161", 161), "[fe80::1]:1161");
}

#[test]
fn community_credentials_keep_their_version() {
    let mut dev = device("sw1", &[1]);
    match auth_for(&dev).unwrap() {
        Auth::Community { community, .. } => assert_eq!(community, "public"),
        other => panic!("unexpected {:?}", other),
    }

    dev.credentials = Credentials::V1 {
        community: "ro".into(),
    };
    assert!(matches!(
        auth_for(&dev).unwrap(),
        Auth::Community { version: async_snmp::CommunityVersion::V1, .. }
    ));
}

#[test]
fn v3_credentials_carry_protocols() {
    let mut dev = device("r1", &[1]);
    dev.credentials = Credentials::V3 {
        user: "poller".into(),
        auth_protocol: Some("SHA".into()),
        auth_password: Some("authpass".into()),
        priv_protocol: Some("AES".into()),
        priv_password: Some("privpass".into()),
    };
    match auth_for(&dev).unwrap() {
        Auth::Usm(usm) => {
            assert_eq!(usm.username, "poller");
            assert_eq!(usm.auth_protocol, Some(async_snmp::AuthProtocol::Sha1));
            assert_eq!(usm.priv_protocol, Some(async_snmp::PrivProtocol::Aes128));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn incomplete_v3_credentials_fail_setup() {
    let mut dev = device("r1", &[1]);
    dev.credentials = Credentials::V3 {
        user: "poller".into(),
        auth_protocol: Some("SHA".into()),
        auth_password: None,
        priv_protocol: None,
        priv_password: None,
    };
    assert!(matches!(auth_for(&dev), Err(TransportError::Setup { .. })));

    dev.credentials = Credentials::V3 {
        user: "poller".into(),
        auth_protocol: Some("WHIRLPOOL".into()),
        auth_password: Some("authpass".into()),
        priv_protocol: None,
        priv_password: None,
    };
    assert!(matches!(auth_for(&dev), Err(TransportError::Setup { .. })));
}

#[tokio::test]
async fn setup_failure_happens_before_any_exchange() {
    let transport = AsyncSnmpTransport::new(Duration::from_secs(1), 10, 161);
    let mut dev = device("r1", &[1]);
    dev.credentials = Credentials::V3 {
        user: "poller".into(),
        auth_protocol: None,
        auth_password: None,
        priv_protocol: Some("AES".into()),
        priv_password: Some("privpass".into()),
    };
    let err = transport.get(&dev, "1.3.6.1.2.1.1.1.0").await.unwrap_err();
    assert!(matches!(err, TransportError::Setup { .. }));
    assert!(!err.is_timeout());
    assert_eq!(transport.cached_clients(), 0);
}

#[test]
fn values_map_onto_raw_values() {
    assert_eq!(raw_value(Value::Counter64(u64::MAX)), RawValue::Counter64(u64::MAX));
    assert_eq!(raw_value(Value::Counter32(7)), RawValue::Counter32(7));
    assert_eq!(raw_value(Value::Gauge32(3)), RawValue::Gauge32(3));
    assert_eq!(raw_value(Value::Integer(-2)), RawValue::Integer(-2));
    assert_eq!(raw_value(Value::TimeTicks(100)), RawValue::TimeTicks(100));
    assert_eq!(
        raw_value(Value::OctetString(Bytes::from_static(b"ge-0/0/1"))),
        RawValue::OctetString(Bytes::from_static(b"ge-0/0/1"))
    );
    assert_eq!(raw_value(Value::NoSuchInstance), RawValue::NoSuchInstance);
    assert_eq!(raw_value(Value::NoSuchObject), RawValue::NoSuchObject);
    assert_eq!(raw_value(Value::EndOfMibView), RawValue::EndOfMibView);
    assert_eq!(raw_value(Value::Null), RawValue::Null);
    assert_eq!(
        raw_value(Value::IpAddress([10, 0, 0, 1])),
        RawValue::Unsupported("IpAddress")
    );
}

#[test]
fn response_must_answer_the_request_in_order() {
    let requested = vec![oid("1.3.6.1.2.1.31.1.1.1.6.1"), oid("1.3.6.1.2.1.2.2.1.10.1")];
    let ok = vec![
        VarBind::new(requested[0].clone(), Value::Counter64(5)),
        // A wrong-typed answer is a value, left to the decoder.
        VarBind::new(requested[1].clone(), Value::Counter64(6)),
    ];
    assert_eq!(
        in_request_order("sw1", &requested, ok).unwrap(),
        vec![RawValue::Counter64(5), RawValue::Counter64(6)]
    );

    let swapped = vec![
        VarBind::new(requested[1].clone(), Value::Counter32(6)),
        VarBind::new(requested[0].clone(), Value::Counter64(5)),
    ];
    assert!(matches!(
        in_request_order("sw1", &requested, swapped),
        Err(TransportError::Malformed { .. })
    ));

    let short = vec![VarBind::new(requested[0].clone(), Value::Counter64(5))];
    assert!(matches!(
        in_request_order("sw1", &requested, short),
        Err(TransportError::Malformed { .. })
    ));
}

#[test]
fn client_errors_are_classified() {
    let timeout = async_snmp::Error::Timeout {
        target: agent(),
        elapsed: Duration::from_millis(1500),
        retries: 0,
    };
    assert_eq!(
        transport_error("sw1.lab", &timeout),
        TransportError::Timeout {
            host: "sw1.lab".into(),
            after: Duration::from_millis(1500),
        }
    );

    let status = async_snmp::Error::Snmp {
        target: agent(),
        status: ErrorStatus::NoSuchName,
        index: 1,
        oid: None,
    };
    match transport_error("sw1.lab", &status) {
        TransportError::ErrorStatus { status, .. } => assert_eq!(status, "noSuchName"),
        other => panic!("unexpected {:?}", other),
    }

    let network = async_snmp::Error::Network {
        target: agent(),
        source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
    };
    assert!(matches!(
        transport_error("sw1.lab", &network),
        TransportError::Unreachable { .. }
    ));

    let malformed = async_snmp::Error::MalformedResponse { target: agent() };
    assert!(matches!(
        transport_error("sw1.lab", &malformed),
        TransportError::Malformed { .. }
    ));
}

#[tokio::test]
async fn mock_answers_programmed_values_and_queued_failures() {
    let mock = MockTransport::new();
    let dev = device("sw1", &[1]);
    mock.set("sw1", "1.1", RawValue::Counter32(9));

    let values = mock.get_many(&dev, &oids(&["1.1", "1.2"])).await.unwrap();
    assert_eq!(values, vec![RawValue::Counter32(9), RawValue::NoSuchInstance]);

    mock.fail_next(
        "sw1",
        TransportError::Timeout {
            host: dev.host.clone(),
            after: Duration::from_secs(1),
        },
    );
    assert!(mock.get(&dev, "1.1").await.unwrap_err().is_timeout());
    assert_eq!(mock.get(&dev, "1.1").await, Ok(RawValue::Counter32(9)));
    assert_eq!(mock.request_count("sw1", "1.1"), 3);
}

#[tokio::test]
async fn mock_fails_whole_exchange_on_a_rejected_oid() {
    let mock = MockTransport::new();
    let dev = device("sw1", &[1]);
    mock.set("sw1", "1.1", RawValue::Counter32(9));
    mock.fail_oid(
        "sw1",
        "1.2",
        TransportError::ErrorStatus {
            host: dev.host.clone(),
            status: "noSuchName".into(),
        },
    );

    let err = mock.get_many(&dev, &oids(&["1.1", "1.2"])).await.unwrap_err();
    assert!(matches!(err, TransportError::ErrorStatus { .. }));
    assert_eq!(mock.get(&dev, "1.1").await, Ok(RawValue::Counter32(9)));

    mock.clear_failure("sw1");
    assert!(mock.get_many(&dev, &oids(&["1.1", "1.2"])).await.is_ok());
}
