use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(HarnessError::Interrupted.exit_code(), 130);
        assert_eq!(HarnessError::Precondition("root".into()).exit_code(), 1);
        let err = HarnessError::DataIntegrity { offset: 16, detail: "x".into() };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_data_integrity_message_names_offset() {
        let err = HarnessError::DataIntegrity {
            offset: 0x1200,
            detail: "read back 0x00, expected 0x58".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x1200"));
        assert!(msg.contains("4608"));
    }

    #[test]
    fn test_external_tool_message_includes_command_and_stderr() {
        let err = HarnessError::ExternalTool {
            command: "mdadm --stop /dev/md0".into(),
            status: "exit status: 1".into(),
            stderr: "mdadm: busy\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mdadm --stop /dev/md0"));
        assert!(msg.ends_with("mdadm: busy"));

        let quiet = HarnessError::ExternalTool {
            command: "fio".into(),
            status: "exit status: 2".into(),
            stderr: String::new(),
        };
        assert_eq!(quiet.to_string(), "command failed (exit status: 2): fio");
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = HarnessError::Interrupted.into();
        let err = err.context("while degrading /dev/ram0");
        let harness = err.downcast_ref::<HarnessError>();
        assert!(matches!(harness, Some(HarnessError::Interrupted)));
    }
