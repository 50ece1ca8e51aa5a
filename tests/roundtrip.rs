//! End-to-end scenarios: decorate, cross the wire, patch back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use notidec::{
    apply_reply, decode_record, encode_record, DecoratedRecord, Limits, NotificationRecord,
    Payload, PayloadFlags, PayloadToken, PayloadTransport, RecordIdentity, RemotePayload,
    TagOverride, TransportError, UserHandle,
};

fn identity(package: &str, id: i32, tag: Option<&str>, uid: u32) -> RecordIdentity {
    RecordIdentity {
        package: package.to_string(),
        id,
        tag: tag.map(str::to_string),
        uid,
        initial_pid: 0,
        score: 0,
        user: UserHandle::new(0),
        override_group_key: None,
        post_time_ms: 1_700_000_000_000,
    }
}

fn payload() -> Payload {
    Payload {
        flags: PayloadFlags::new(0),
        when_ms: 1_700_000_000_000,
        title: Some("title".to_string()),
        text: Some("text".to_string()),
        extras: Default::default(),
    }
}

struct CountingTransport {
    fetches: AtomicUsize,
    payload: Payload,
}

impl CountingTransport {
    fn new(payload: Payload) -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            payload,
        }
    }
}

impl PayloadTransport for CountingTransport {
    fn fetch_payload(&self, _token: PayloadToken) -> Result<Payload, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.payload.clone())
    }

    fn fetch_flags(&self, _token: PayloadToken) -> Result<PayloadFlags, TransportError> {
        Ok(self.payload.flags)
    }
}

#[test]
fn decorate_then_collapse_restores_original_identity() {
    let mut record = DecoratedRecord::from_record(NotificationRecord {
        identity: identity("app.example", 1, None, 1000),
        payload: payload(),
    });
    let original_key = record.original_key().to_string();

    record.set_tag(Some("promo".to_string()));
    assert_eq!(record.tag(), Some("promo"));
    assert_eq!(record.original_tag(), None);
    assert!(record.is_decorated());
    assert_ne!(record.key(), original_key);

    record.set_tag(None);
    assert_eq!(record.tag(), None);
    assert!(!record.is_decorated());
    assert_eq!(record.key(), original_key);
}

#[test]
fn identical_undecorated_records_share_a_key() {
    let a = DecoratedRecord::from_record(NotificationRecord {
        identity: identity("app.example", 1, Some("chat"), 1000),
        payload: payload(),
    });
    let b = DecoratedRecord::from_record(NotificationRecord {
        identity: identity("app.example", 1, Some("chat"), 1000),
        payload: payload(),
    });
    assert_eq!(a.key(), b.key());
    assert_eq!(a.original_key(), b.original_key());
}

#[test]
fn full_frame_crosses_the_process_boundary() {
    let limits = Limits::default();
    let transport = Arc::new(CountingTransport::new(payload()));
    let token = PayloadToken::new();

    // Producer side: remote capability, decorated.
    let mut producer = DecoratedRecord::new(
        identity("app.example", 1, Some("chat"), 1000),
        Arc::new(RemotePayload::new(token, transport.clone())),
    );
    producer.set_tag(Some("promo".to_string()));
    let bytes = encode_record(&producer, &limits).unwrap();

    // Consumer side: decode against its own transport, read lazily.
    let consumer_transport = Arc::new(CountingTransport::new(payload()));
    let consumer_dyn: Arc<dyn PayloadTransport> = consumer_transport.clone();
    let mut consumer = decode_record(&bytes, &consumer_dyn, &limits).unwrap();

    assert_eq!(consumer.tag(), Some("promo"));
    assert_eq!(consumer.original_tag(), Some("chat"));
    assert_eq!(consumer.key(), producer.key());
    assert!(!consumer.payload_source().is_local());
    assert_eq!(consumer_transport.fetches.load(Ordering::SeqCst), 0);

    // First read fetches, second is a cache hit.
    let first = consumer.payload().unwrap();
    let second = consumer.payload().unwrap();
    assert_eq!(first, second);
    assert_eq!(consumer_transport.fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn reply_frame_returns_decoration_to_the_caller() {
    let limits = Limits::default();
    let mut caller = DecoratedRecord::from_record(NotificationRecord {
        identity: identity("app.example", 1, None, 1000),
        payload: payload(),
    });
    let full = encode_record(&caller, &limits).unwrap();

    let transport: Arc<dyn PayloadTransport> = Arc::new(CountingTransport::new(payload()));
    let mut callee = decode_record(&full, &transport, &limits).unwrap();
    callee.set_id(42).set_tag(Some("promo".to_string()));
    callee.mark_reply();
    let reply = encode_record(&callee, &limits).unwrap();
    assert!(reply.len() < full.len());

    apply_reply(&mut caller, &reply, &limits).unwrap();
    assert_eq!(caller.id(), 42);
    assert_eq!(caller.tag(), Some("promo"));
    assert_eq!(caller.key(), callee.key());
    assert_eq!(caller.id_override(), Some(42));
    assert_eq!(
        caller.tag_override(),
        &TagOverride::Overridden(Some("promo".to_string()))
    );
}

#[test]
fn decoration_unaware_bytes_decode_with_defaults() {
    let limits = Limits::default();
    let plain = NotificationRecord {
        identity: identity("app.example", 5, Some("legacy"), 1000),
        payload: payload(),
    };
    let bytes = plain.encode_body(&limits).unwrap();

    let transport = Arc::new(CountingTransport::new(payload()));
    let transport_dyn: Arc<dyn PayloadTransport> = transport.clone();
    let mut decoded = decode_record(&bytes, &transport_dyn, &limits).unwrap();

    assert!(!decoded.is_decorated());
    assert_eq!(decoded.tag(), Some("legacy"));
    assert_eq!(decoded.id(), 5);
    // No capability reference in the plain shape: the payload is resident.
    assert!(decoded.payload_source().is_local());
    assert_eq!(decoded.payload().unwrap(), payload());
    assert_eq!(transport.fetches.load(Ordering::SeqCst), 0);
}

#[test]
fn ongoing_flag_blocks_clearing_across_the_wire() {
    let limits = Limits::default();
    let ongoing = Payload {
        flags: PayloadFlags::ONGOING,
        ..payload()
    };
    let record = DecoratedRecord::from_record(NotificationRecord {
        identity: identity("app.example", 1, None, 1000),
        payload: ongoing.clone(),
    });
    let bytes = encode_record(&record, &limits).unwrap();

    let transport: Arc<dyn PayloadTransport> = Arc::new(CountingTransport::new(ongoing));
    let decoded = decode_record(&bytes, &transport, &limits).unwrap();
    assert!(decoded.is_ongoing().unwrap());
    assert!(!decoded.is_clearable().unwrap());
}
