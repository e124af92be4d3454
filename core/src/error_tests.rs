#[cfg(test)]
mod tests {
    use crate::error::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn test_core_error_display() {
        let err = CoreError::ValidationError("test validation".to_string());
        assert_eq!(err.to_string(), "Validation error: test validation");

        let err = CoreError::StdinClosed("stdin of pid 42".to_string());
        assert_eq!(err.to_string(), "Stdin closed: stdin of pid 42");

        let err = CoreError::InvalidState("child not running".to_string());
        assert_eq!(err.to_string(), "Invalid state: child not running");

        let err = CoreError::StreamRead("stdout: broken".to_string());
        assert_eq!(err.to_string(), "Stream read error: stdout: broken");
    }

    #[test]
    fn test_core_error_from_std_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let core_err: CoreError = io_err.into();

        if let CoreError::IoError(ref inner) = core_err {
            assert_eq!(inner.kind(), io::ErrorKind::NotFound);
        } else {
            panic!("Expected CoreError::IoError variant");
        }
        assert!(core_err.source().is_some());
    }

    #[test]
    fn test_io_error_classification() {
        assert!(CoreError::StreamRead("x".into()).is_io_error());
        assert!(CoreError::StreamWrite("x".into()).is_io_error());
        assert!(CoreError::ProcessSignal("x".into()).is_io_error());
        assert!(!CoreError::ProcessSpawn("x".into()).is_io_error());
        assert!(!CoreError::StdinClosed("x".into()).is_io_error());
    }

    #[test]
    fn test_result_type_alias() {
        #[allow(clippy::unnecessary_wraps)]
        fn returns_result() -> Result<String> {
            Ok("success".to_string())
        }

        fn returns_error() -> Result<String> {
            Err(CoreError::ProcessSpawn("test".to_string()))
        }

        assert!(returns_result().is_ok());
        assert!(matches!(returns_error(), Err(CoreError::ProcessSpawn(_))));
    }
}
