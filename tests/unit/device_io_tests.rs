// moved from src/device_io.rs
use super::*;
use anyhow::Result;
use tempfile::NamedTempFile;

    fn scratch(len: u64) -> Result<NamedTempFile> {
        let tmp = NamedTempFile::new()?;
        tmp.as_file().set_len(len)?;
        Ok(tmp)
    }

    #[test]
    fn open_regular_file_defaults_block_size() -> Result<()> {
        let tmp = scratch(64 * 1024)?;
        let dev = DirectDevice::open(tmp.path())?;
        // Regular files won't support BLKSSZGET
        assert_eq!(dev.block_size(), 4096);
        Ok(())
    }

    #[test]
    fn direct_device_roundtrip() -> Result<()> {
        let tmp = scratch(64 * 1024)?;
        let mut dev = DirectDevice::open(tmp.path())?;
        let data = vec![0x5Au8; 8192];
        dev.write_at(4096, &data)?;

        let mut back = vec![0u8; 8192];
        dev.read_at(4096, &mut back)?;
        assert_eq!(back, data);
        assert_eq!(dev.size()?, 64 * 1024);
        Ok(())
    }

    #[test]
    fn missing_direct_io_is_a_precondition_failure() {
        let err = open_error(Path::new("/mnt/nfs/disk"), io::Error::from_raw_os_error(libc::EINVAL));
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::Precondition(msg)) => {
                assert_eq!(msg, "/mnt/nfs/disk does not support O_DIRECT")
            }
            other => panic!("expected precondition failure, got {:?}", other),
        }

        let err = open_error(Path::new("/dev/nope"), io::Error::from_raw_os_error(libc::ENOENT));
        assert!(err.downcast_ref::<HarnessError>().is_none());
        assert!(format!("{:#}", err).contains("Failed to open \"/dev/nope\""));
    }

    #[test]
    fn open_missing_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectDevice::open(&dir.path().join("absent")).err().unwrap();
        assert!(err.downcast_ref::<HarnessError>().is_none());
        assert!(err.downcast_ref::<io::Error>().is_some());
    }

    #[test]
    fn direct_device_rejects_unaligned_length() -> Result<()> {
        let tmp = scratch(64 * 1024)?;
        let mut dev = DirectDevice::open(tmp.path())?;
        assert!(dev.write_at(0, &[1u8; 100]).is_err());
        Ok(())
    }

    #[test]
    fn disk_size_and_zero_disk() -> Result<()> {
        let tmp = scratch(3 * 1024 * 1024)?;
        std::fs::write(tmp.path(), vec![0xFFu8; 3 * 1024 * 1024])?;
        assert_eq!(disk_size(tmp.path())?, 3 * 1024 * 1024);

        zero_disk(tmp.path(), 2 * 1024 * 1024)?;
        let contents = std::fs::read(tmp.path())?;
        assert!(contents[..2 * 1024 * 1024].iter().all(|&b| b == 0));
        assert!(contents[2 * 1024 * 1024..].iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn mem_device_shares_backing_store() -> Result<()> {
        let mut a = MemDevice::new("mem0", 4096);
        let mut b = a.clone();
        a.write_at(512, &[7u8; 512])?;

        let mut back = [0u8; 512];
        b.read_at(512, &mut back)?;
        assert_eq!(back, [7u8; 512]);
        assert_eq!(b.size()?, 4096);
        Ok(())
    }

    #[test]
    fn mem_device_bounds_checked() {
        let mut dev = MemDevice::new("mem0", 1024);
        assert!(dev.write_at(1000, &[0u8; 512]).is_err());
        let mut buf = [0u8; 16];
        assert!(dev.read_at(u64::MAX - 4, &mut buf).is_err());
    }
