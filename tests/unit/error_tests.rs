//! Unit tests for the error taxonomy and its host-shared code mapping.

use icaserial::errors::{
    IcaError, ERROR_BAD_COMMAND, ERROR_BAD_ENVIRONMENT, ERROR_BAD_FORMAT, ERROR_BUSY,
    ERROR_INVALID_PARAMETER, ERROR_NO_MORE_FILES, ERROR_PROC_NOT_FOUND,
};

/// Every variant maps onto its fixed host-shared code.
#[test]
fn variants_map_to_shared_codes() {
    let cases = [
        (IcaError::BadEnvironment("x".into()), ERROR_BAD_ENVIRONMENT),
        (IcaError::BadFormat("x".into()), ERROR_BAD_FORMAT),
        (IcaError::NoMoreFiles("x".into()), ERROR_NO_MORE_FILES),
        (IcaError::BadCommand("x".into()), ERROR_BAD_COMMAND),
        (IcaError::InvalidParameter("x".into()), ERROR_INVALID_PARAMETER),
        (IcaError::ProcNotFound("x".into()), ERROR_PROC_NOT_FOUND),
        (IcaError::Busy("x".into()), ERROR_BUSY),
        (IcaError::Io("x".into()), ERROR_BAD_ENVIRONMENT),
    ];
    for (err, code) in cases {
        assert_eq!(err.code(), code, "wrong code for {err}");
    }
}

/// Display carries both the category and the message text.
#[test]
fn display_includes_category_and_message() {
    let err = IcaError::BadCommand("unparseable request".into());
    let text = err.to_string();
    assert!(text.contains("bad command"), "got: {text}");
    assert!(text.contains("unparseable request"), "got: {text}");
    assert_eq!(err.message(), "unparseable request");
}

/// I/O errors fold into the taxonomy with the bad-environment code.
#[test]
fn io_errors_fold_into_taxonomy() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err = IcaError::from(io);
    assert_eq!(err.code(), ERROR_BAD_ENVIRONMENT);
    assert!(err.to_string().contains("gone"));
}
