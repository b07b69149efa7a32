use idlegate::http::request::{ConnectionIntent, Headers, Method, RequestBuilder, Version};

#[test]
fn test_request_header_retrieval_ignores_case() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .header("Host", "example.com")
        .header("Content-Type", "application/json")
        .build()
        .unwrap();

    assert_eq!(req.header("host"), Some("example.com"));
    assert_eq!(req.header("CONTENT-TYPE"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_content_length_is_body_length() {
    let req = RequestBuilder::new()
        .method(Method::POST)
        .path("/api")
        .header("Content-Length", "5")
        .body("hello")
        .build()
        .unwrap();

    assert_eq!(req.content_length(), 5);
    assert_eq!(&req.body[..], b"hello");
}

#[test]
fn test_intent_resolution_table() {
    assert_eq!(
        ConnectionIntent::resolve(Version::Http11, false, false),
        ConnectionIntent::KeepAlive
    );
    assert_eq!(
        ConnectionIntent::resolve(Version::Http11, true, true),
        ConnectionIntent::Close
    );
    assert_eq!(
        ConnectionIntent::resolve(Version::Http10, false, true),
        ConnectionIntent::KeepAlive
    );
    assert_eq!(
        ConnectionIntent::resolve(Version::Http10, false, false),
        ConnectionIntent::Close
    );
}

#[test]
fn test_method_parsing() {
    assert_eq!(Method::from_str("GET"), Some(Method::GET));
    assert_eq!(Method::from_str("DELETE"), Some(Method::DELETE));
    assert_eq!(Method::from_str("get"), None);
    assert_eq!(Method::from_str("BREW"), None);
    assert_eq!(Method::POST.as_str(), "POST");
}

#[test]
fn test_version_parsing() {
    assert_eq!(Version::from_str("HTTP/1.1"), Some(Version::Http11));
    assert_eq!(Version::from_str("HTTP/1.0"), Some(Version::Http10));
    assert_eq!(Version::from_str("HTTP/2.0"), None);
}

#[test]
fn test_headers_keep_arrival_order() {
    let mut headers = Headers::new();
    headers.insert("B", "2");
    headers.insert("A", "1");

    let names: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
    assert_eq!(names, vec!["B", "A"]);
    assert_eq!(headers.len(), 2);
    assert!(headers.contains("a"));
}

#[test]
fn test_headers_set_replaces_every_value() {
    let mut headers = Headers::new();
    headers.insert("Accept", "a");
    headers.insert("X-Trace", "1");
    headers.insert("accept", "b");

    headers.set("ACCEPT", "c");

    assert_eq!(headers.len(), 2);
    assert_eq!(headers.get("accept"), Some("c"));
    let names: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
    assert_eq!(names, vec!["X-Trace", "ACCEPT"]);
}

#[test]
fn test_builder_requires_method_and_path() {
    assert!(RequestBuilder::new().path("/").build().is_err());
    assert!(RequestBuilder::new().method(Method::GET).build().is_err());
}
