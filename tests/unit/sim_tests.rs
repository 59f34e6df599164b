use super::*;
use crate::config::DiskSource;

    fn config(level: RaidLevel, disks: usize) -> ArrayConfiguration {
        ArrayConfiguration {
            level,
            chunk_size: 4096,
            disks: DiskSource::RamDisks { count: disks },
            size: Some(256 << 10),
            ..ArrayConfiguration::default()
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_capacity_follows_data_members() -> Result<()> {
        let raid5 = SimArray::new(config(RaidLevel::Raid5, 4))?;
        assert_eq!(raid5.capacity()?, 3 * (256 << 10));
        let raid6 = SimArray::new(config(RaidLevel::Raid6, 4))?;
        assert_eq!(raid6.capacity()?, 2 * (256 << 10));
        let raid1 = SimArray::new(config(RaidLevel::Raid1, 3))?;
        assert_eq!(raid1.capacity()?, 256 << 10);
        Ok(())
    }

    #[test]
    fn test_unaligned_write_spanning_stripes() -> Result<()> {
        let mut array = SimArray::new(config(RaidLevel::Raid5, 3))?;
        array.setup()?;
        let mut dev = array.open_direct()?;
        let data = pattern(20_000, 3);
        dev.write_at(5_000, &data)?;

        let mut back = vec![0u8; data.len()];
        dev.read_at(5_000, &mut back)?;
        assert_eq!(back, data);
        let end = dev.size()?;
        assert!(dev.write_at(end - 10, &[0u8; 20]).is_err());
        Ok(())
    }

    #[test]
    fn test_degraded_reads_reconstruct() -> Result<()> {
        let mut array = SimArray::new(config(RaidLevel::Raid5, 4))?;
        array.setup()?;
        let mut dev = array.open_direct()?;
        let data = pattern(64 << 10, 7);
        dev.write_at(0, &data)?;

        array.degrade("sim1")?;
        let mut back = vec![0u8; data.len()];
        dev.read_at(0, &mut back)?;
        assert_eq!(back, data);

        // a second failure exceeds single parity
        assert!(array.degrade("sim2").is_err());
        Ok(())
    }

    #[test]
    fn test_recover_resyncs_member() -> Result<()> {
        let mut array = SimArray::new(config(RaidLevel::Raid6, 5))?;
        array.setup()?;
        let mut dev = array.open_direct()?;
        dev.write_at(0, &pattern(32 << 10, 1))?;

        array.degrade("sim0")?;
        let written_degraded = pattern(16 << 10, 9);
        dev.write_at(8 << 10, &written_degraded)?;
        array.recover("sim0")?;
        assert_eq!(
            array.member_states()?[0],
            ("sim0".to_string(), MemberState::Rebuilding)
        );

        array.wait()?;
        assert!(array
            .member_states()?
            .iter()
            .all(|(_, s)| *s == MemberState::InSync));

        // with two other members gone, sim0 must carry real data now
        array.degrade("sim1")?;
        array.degrade("sim2")?;
        let mut back = vec![0u8; 16 << 10];
        dev.read_at(8 << 10, &mut back)?;
        assert_eq!(back, written_degraded);
        Ok(())
    }

    #[test]
    fn test_recover_requires_failed_member() -> Result<()> {
        let mut array = SimArray::new(config(RaidLevel::Raid5, 3))?;
        assert!(array.recover("sim0").is_err());
        assert!(array.degrade("sim9").is_err());
        Ok(())
    }

    #[test]
    fn test_grow_preserves_contents() -> Result<()> {
        let mut array = SimArray::new(config(RaidLevel::Raid5, 3))?;
        array.setup()?;
        let before = array.capacity()?;
        let mut dev = array.open_direct()?;
        let data = pattern(before as usize, 5);
        dev.write_at(0, &data)?;

        assert_eq!(array.grow()?, 4);
        assert_eq!(array.get_disks()?.len(), 4);
        let after = array.capacity()?;
        assert!(after > before);
        assert_eq!(&array.snapshot()?[..before as usize], &data[..]);

        // the new space is writable
        dev.write_at(before, &[0xAB; 4096])?;
        let mut back = [0u8; 4096];
        dev.read_at(before, &mut back)?;
        assert_eq!(back, [0xAB; 4096]);
        Ok(())
    }

    #[test]
    fn test_raid0_cannot_degrade() -> Result<()> {
        let mut array = SimArray::new(config(RaidLevel::Raid0, 2))?;
        assert!(array.degrade("sim0").is_err());
        assert_eq!(array.get_level()?, RaidLevel::Raid0);
        Ok(())
    }

    #[test]
    fn test_setup_keeps_member_contents() -> Result<()> {
        let mut array = SimArray::new(config(RaidLevel::Raid5, 3))?;
        array.setup()?;
        array.open_direct()?.write_at(0, &[0x11; 512])?;
        array.config_mut().thread_count = Some(8);
        array.setup()?;
        assert_eq!(array.setups(), 2);

        let mut back = [0u8; 512];
        array.open_direct()?.read_at(0, &mut back)?;
        assert_eq!(back, [0x11; 512]);
        Ok(())
    }

    #[test]
    fn test_zero_all_disks_and_special_disk() -> Result<()> {
        let mut array = SimArray::new(config(RaidLevel::Raid5, 3))?;
        array.setup()?;
        array.open_direct()?.write_at(0, &[0xFF; 8192])?;
        array.open_disk(SimArray::SPECIAL_DISK)?.write_at(0, &[0xFF; 512])?;

        array.zero_all_disks(64 << 10)?;
        let mut back = [1u8; 8192];
        array.open_direct()?.read_at(0, &mut back)?;
        assert!(back.iter().all(|&b| b == 0));
        assert!(array.reference().snapshot()[..512].iter().all(|&b| b == 0));
        assert_eq!(array.disk_size("sim0")?, 256 << 10);
        assert_eq!(array.disk_size(SimArray::SPECIAL_DISK)?, 256 << 10);
        Ok(())
    }
