use sinapsi::error::SinapsiError;

#[test]
fn error_constructors_group_1() {
    assert!(matches!(
        SinapsiError::config("x"),
        SinapsiError::Config { .. }
    ));
    assert!(matches!(
        SinapsiError::modbus("x"),
        SinapsiError::Modbus { .. }
    ));
    assert!(matches!(
        SinapsiError::timeout("x"),
        SinapsiError::Timeout { .. }
    ));
    assert!(matches!(
        SinapsiError::not_connected("x"),
        SinapsiError::NotConnected { .. }
    ));
}

#[test]
fn error_constructors_group_2() {
    assert!(matches!(
        SinapsiError::shutdown("x"),
        SinapsiError::Shutdown { .. }
    ));
    assert!(matches!(
        SinapsiError::decode("x"),
        SinapsiError::Decode { .. }
    ));
    assert!(matches!(SinapsiError::io("x"), SinapsiError::Io { .. }));

    let ser: SinapsiError = serde_json::from_str::<serde_json::Value>("{")
        .unwrap_err()
        .into();
    assert!(matches!(ser, SinapsiError::Serialization { .. }));
}

#[test]
fn io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: SinapsiError = io.into();
    assert_eq!(err.to_string(), "I/O error: missing");
    assert!(!err.is_transport());
}

#[test]
fn errors_clone_for_shared_results() {
    let err = SinapsiError::timeout("Read operation timed out");
    let copy = err.clone();
    assert_eq!(err.to_string(), copy.to_string());
    assert!(copy.is_timeout());
}
