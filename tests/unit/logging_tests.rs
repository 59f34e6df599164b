// moved from src/logging.rs
use super::*;
use tempfile::NamedTempFile;

    #[test]
    fn test_annotation_line_format() {
        let a = Annotation::Test {
            offset: 1544 * 512,
            sector: 1544,
            sectors: 1,
            pattern: b'Y',
        };
        assert_eq!(a.to_line(), "TEST 0xc1000 1544 1 b'Y'");
        assert_eq!(Annotation::status("Degrading /dev/ram1").to_line(), "Degrading /dev/ram1");
    }

    #[test]
    fn test_pattern_repr() {
        assert_eq!(pattern_repr(b'X'), "b'X'");
        assert_eq!(pattern_repr(0), r"b'\x00'");
        assert_eq!(pattern_repr(0xff), r"b'\xff'");
        assert_eq!(pattern_repr(b'\n'), r"b'\n'");
        assert_eq!(pattern_repr(b'\\'), r"b'\\'");
        assert_eq!(pattern_repr(b'\''), r"b'\''");
    }

    #[test]
    fn test_event_log_prunes_oldest() {
        let mut log = EventLog::new(2);
        log.annotate(&Annotation::status("one")).unwrap();
        log.annotate(&Annotation::status("two")).unwrap();
        log.annotate(&Annotation::status("three")).unwrap();
        assert_eq!(log.statuses(), vec!["two", "three"]);
        assert_eq!(log.events().len(), 2);
        assert!(log.events()[0].to_text().ends_with("] two"));
    }

    #[test]
    fn test_event_log_counts_test_writes() {
        let mut log = EventLog::default();
        log.annotate(&Annotation::Test { offset: 0, sector: 0, sectors: 1, pattern: 1 }).unwrap();
        status(&mut log, "Growing").unwrap();
        assert_eq!(log.test_writes(), 1);
        assert_eq!(log.lines(), vec!["TEST 0x0 0 1 b'\\x01'", "Growing"]);
        log.clear();
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_kmsg_sink_writes_lines() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let mut sink = KmsgSink::open(tmp.path()).unwrap();
            sink.annotate(&Annotation::status("hello")).unwrap();
            sink.annotate(&Annotation::Test { offset: 512, sector: 1, sectors: 2, pattern: b'A' })
                .unwrap();
        }
        let contents = std::fs::read_to_string(tmp.path()).unwrap();
        assert_eq!(contents, "hello\nTEST 0x200 1 2 b'A'\n");
    }
