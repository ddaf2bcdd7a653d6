use super::*;

fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn valid_headers() -> DeliveryHeaders {
    DeliveryHeaders {
        delivery_id: DeliveryId::new("d-1").unwrap(),
        event_name: "issues".to_string(),
        signature: "sha256=00".to_string(),
    }
}

#[test]
fn test_headers_are_matched_case_insensitively() {
    let parsed = DeliveryHeaders::from_http_headers(&headers(&[
        ("x-github-delivery", "72d3162e-cc78-11e3-81ab-4c9367dc0958"),
        ("X-GITHUB-EVENT", "pull_request"),
        ("X-Hub-Signature-256", "sha256=abc"),
    ]))
    .unwrap();

    assert_eq!(parsed.delivery_id.as_str(), "72d3162e-cc78-11e3-81ab-4c9367dc0958");
    assert_eq!(parsed.event_name, "pull_request");
    assert_eq!(parsed.signature, "sha256=abc");
}

#[test]
fn test_missing_or_empty_headers_are_rejected() {
    let missing_signature = DeliveryHeaders::from_http_headers(&headers(&[
        ("x-github-delivery", "d-1"),
        ("x-github-event", "ping"),
    ]));
    assert_eq!(
        missing_signature,
        Err(ValidationError::Required {
            field: SIGNATURE_HEADER.to_string()
        })
    );

    let empty_event = DeliveryHeaders::from_http_headers(&headers(&[
        ("x-github-delivery", "d-1"),
        ("x-github-event", "  "),
        ("x-hub-signature-256", "sha256=abc"),
    ]));
    assert!(matches!(empty_event, Err(ValidationError::Required { .. })));

    let bad_id = DeliveryHeaders::from_http_headers(&headers(&[
        ("x-github-delivery", "../../etc"),
        ("x-github-event", "push"),
        ("x-hub-signature-256", "sha256=abc"),
    ]));
    assert!(matches!(
        bad_id,
        Err(ValidationError::InvalidCharacters { .. })
    ));
}

#[test]
fn test_delivery_reads_action_and_installation() {
    let body = Bytes::from_static(br#"{"action":"opened","installation":{"id":42},"issue":{}}"#);
    let delivery = Delivery::from_parts(valid_headers(), body.clone(), Utc::now()).unwrap();

    assert_eq!(delivery.action.as_deref(), Some("opened"));
    assert_eq!(delivery.installation_id, Some(InstallationId::new(42)));
    assert_eq!(delivery.raw_payload, body);
    assert_eq!(delivery.event_label(), "issues.opened");
}

#[test]
fn test_delivery_without_action_or_installation() {
    let body = Bytes::from_static(br#"{"zen":"Keep it logically awesome."}"#);
    let delivery = Delivery::from_parts(valid_headers(), body, Utc::now()).unwrap();

    assert_eq!(delivery.action, None);
    assert_eq!(delivery.installation_id, None);
    assert_eq!(delivery.event_label(), "issues");
}

#[test]
fn test_non_object_payloads_are_rejected() {
    for body in [&b"[1,2]"[..], b"\"text\"", b"", b"{not json", b"42"] {
        let result = Delivery::from_parts(valid_headers(), Bytes::copy_from_slice(body), Utc::now());
        assert!(
            matches!(result, Err(ValidationError::InvalidFormat { .. })),
            "accepted {:?}",
            String::from_utf8_lossy(body)
        );
    }
}

#[test]
fn test_delivery_serde_keeps_raw_bytes_exact() {
    let body = Bytes::from_static(b"{ \"action\" : \"closed\" ,\n \"x\":1 }");
    let delivery = Delivery::from_parts(valid_headers(), body.clone(), Utc::now()).unwrap();

    let json = serde_json::to_string(&delivery).unwrap();
    let restored: Delivery = serde_json::from_str(&json).unwrap();

    assert_eq!(restored.raw_payload, body);
    assert_eq!(restored, delivery);
}

#[test]
fn test_payload_decodes_into_handler_type() {
    #[derive(Deserialize)]
    struct Issue {
        number: u64,
    }
    #[derive(Deserialize)]
    struct IssuesEvent {
        issue: Issue,
    }

    let body = Bytes::from_static(br#"{"action":"opened","issue":{"number":5}}"#);
    let delivery = Delivery::from_parts(valid_headers(), body, Utc::now()).unwrap();

    let event: IssuesEvent = delivery.payload().unwrap();
    assert_eq!(event.issue.number, 5);
}
