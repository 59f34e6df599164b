// moved from src/workload.rs
use super::*;
use crate::artifact::MemoryArtifact;
use crate::device_io::MemDevice;
use crate::logging::EventLog;
use proptest::prelude::*;

    const DEV_SIZE: usize = 8 << 20;

    fn generator(seed: u64) -> (MemDevice, WorkloadGenerator<EventLog, MemoryArtifact>) {
        let dev = MemDevice::new("mem0", DEV_SIZE);
        let gen = WorkloadGenerator::new(
            Box::new(dev.clone()),
            EventLog::default(),
            MemoryArtifact::default(),
            seed,
        );
        (dev, gen)
    }

    /// Flips one byte of every read at a fixed absolute offset
    struct CorruptingDevice {
        inner: MemDevice,
        bad_offset: u64,
    }

    impl BlockDevice for CorruptingDevice {
        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
            self.inner.write_at(offset, data)
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read_at(offset, buf)?;
            if self.bad_offset >= offset && self.bad_offset < offset + buf.len() as u64 {
                buf[(self.bad_offset - offset) as usize] ^= 0xFF;
            }
            Ok(())
        }

        fn size(&mut self) -> Result<u64> {
            self.inner.size()
        }

        fn block_size(&self) -> usize {
            512
        }

        fn describe(&self) -> String {
            "corrupting".to_string()
        }
    }

    #[test]
    fn test_no_cross_write_corruption() -> Result<()> {
        let (mut dev, mut gen) = generator(0);
        gen.write_test(0, b'X', 512)?;
        gen.write_test(1544, b'Y', 512)?;

        let mut sector = [0u8; 512];
        dev.read_at(1544 * 512, &mut sector)?;
        assert_eq!(sector, [b'Y'; 512]);
        dev.read_at(0, &mut sector)?;
        assert_eq!(sector, [b'X'; 512]);
        Ok(())
    }

    #[test]
    fn test_annotation_precedes_each_write() -> Result<()> {
        let (_dev, mut gen) = generator(0);
        gen.write_test(3, b'Q', 2048)?;
        assert_eq!(gen.sink().lines(), vec!["TEST 0x600 3 4 b'Q'"]);
        assert_eq!(gen.totals(), (1, 2048));
        Ok(())
    }

    #[test]
    fn test_mismatch_reports_absolute_offset_and_persists_readback() {
        let inner = MemDevice::new("mem0", DEV_SIZE);
        let bad_offset = 100 * 512 + 77;
        let mut gen = WorkloadGenerator::new(
            Box::new(CorruptingDevice { inner, bad_offset }),
            EventLog::default(),
            MemoryArtifact::default(),
            0,
        );

        gen.write_test(0, b'a', 512).unwrap();
        let err = gen.write_test(99, b'b', 4096).unwrap_err();
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::DataIntegrity { offset, .. }) => assert_eq!(*offset, bad_offset),
            other => panic!("expected data integrity failure, got {:?}", other),
        }

        let dumps = &gen.artifact().dumps;
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].len(), 4096);
        assert_eq!(dumps[0][512 + 77], b'b' ^ 0xFF);
    }

    #[test]
    fn test_failed_write_is_counted() {
        let inner = MemDevice::new("mem0", DEV_SIZE);
        let mut gen = WorkloadGenerator::new(
            Box::new(CorruptingDevice { inner, bad_offset: 0 }),
            EventLog::default(),
            MemoryArtifact::default(),
            0,
        );
        gen.write_test(1, b'x', 512).unwrap();
        assert!(gen.write_test(0, b'x', 512).is_err());
        assert_eq!(gen.sink().test_writes(), 2);
        assert_eq!(gen.totals().0, 2);
    }

    #[test]
    fn test_reference_receives_mirror() -> Result<()> {
        let (dev, mut gen) = generator(11);
        let reference = MemDevice::new("ref", DEV_SIZE);
        gen.attach_reference(Box::new(reference.clone()));
        gen.basic_tests()?;
        gen.run_random(25, 0)?;
        assert_eq!(reference.snapshot(), dev.snapshot());

        assert!(gen.detach_reference().is_some());
        gen.write_test(0, 0x77, 512)?;
        assert_ne!(reference.snapshot(), dev.snapshot());
        Ok(())
    }

    #[test]
    fn test_basic_sequence_final_state() -> Result<()> {
        let (dev, mut gen) = generator(0);
        gen.basic_tests()?;
        let image = dev.snapshot();
        // the last write covers the first MiB with 'Z'
        assert!(image[..1 << 20].iter().all(|&b| b == b'Z'));
        assert_eq!(gen.sink().test_writes(), BASIC_SEQUENCE.len());
        Ok(())
    }

    #[test]
    fn test_fill_byte_wraps() {
        let mut random = RandomWorkload::new(0);
        assert_eq!(random.next(0x30, 0).fill_byte, 0x30);
        assert_eq!(random.next(0, 255).fill_byte, 255);
        assert_eq!(random.next(0, 256).fill_byte, 0);
        assert_eq!(random.next(250, 10).fill_byte, 4);
    }

    proptest! {
        #[test]
        fn prop_random_sequence_is_reproducible(seed in any::<u64>(), offset in 0usize..512) {
            let mut a = RandomWorkload::new(seed);
            let mut b = RandomWorkload::new(seed);
            for i in 0..50 {
                let (x, y) = (a.next(offset, i), b.next(offset, i));
                prop_assert_eq!(x, y);
                prop_assert!(x.offset_sectors < RANDOM_SECTOR_LIMIT);
                prop_assert!(x.size_bytes >= 512 && x.size_bytes < RANDOM_SIZE_LIMIT);
                prop_assert_eq!(x.size_bytes % 512, 0);
            }
        }

        #[test]
        fn prop_write_test_reads_back_fill(sector in 0u64..4096, sectors in 1usize..64, fill in any::<u8>()) {
            let (mut dev, mut gen) = generator(0);
            gen.write_test(sector, fill, sectors * 512).unwrap();
            let mut back = vec![0u8; sectors * 512];
            dev.read_at(sector * 512, &mut back).unwrap();
            prop_assert!(back.iter().all(|&b| b == fill));
        }
    }
