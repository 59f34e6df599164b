use super::*;
use crate::artifact::MemoryArtifact;
use crate::config::{ArrayConfiguration, DiskSource, RaidLevel};
use crate::device_io::BlockDevice;
use crate::logging::EventLog;
use crate::sim::{MemberState, SimArray};

    fn setup(level: RaidLevel, disks: usize) -> (SimArray, WorkloadGenerator<EventLog, MemoryArtifact>) {
        let mut array = SimArray::new(ArrayConfiguration {
            level,
            chunk_size: 4096,
            disks: DiskSource::RamDisks { count: disks },
            ..ArrayConfiguration::default()
        })
        .unwrap();
        array.setup().unwrap();
        let device = array.open_direct().unwrap();
        let gen = WorkloadGenerator::new(device, EventLog::default(), MemoryArtifact::default(), 1);
        (array, gen)
    }

    fn read(gen: &mut WorkloadGenerator<EventLog, MemoryArtifact>, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        gen.device_mut().read_at(offset, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_degrade_visits_every_member_in_order() -> Result<()> {
        let (mut array, mut gen) = setup(RaidLevel::Raid5, 3);
        let mut injector = FaultInjector::new();
        injector.degrade_test(&mut array, &mut gen, 6, false)?;

        assert_eq!(
            gen.sink().statuses(),
            vec![
                "Degraded sim0",
                "Recovered sim0",
                "Degraded sim1",
                "Recovered sim1",
                "Degraded sim2",
                "Recovered sim2",
            ]
        );
        // count / 2 writes in each of the two states, per member
        assert_eq!(gen.sink().test_writes(), 18);
        assert_eq!(injector.health(), &ArrayHealth::Clean);
        assert_eq!(injector.history().len(), 1 + 3 * 3);
        assert_eq!(
            &injector.history()[..4],
            &[
                ArrayHealth::Clean,
                ArrayHealth::Degraded("sim0".to_string()),
                ArrayHealth::Recovering("sim0".to_string()),
                ArrayHealth::Clean,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_quick_degrade_stops_after_first_member() -> Result<()> {
        let (mut array, mut gen) = setup(RaidLevel::Raid5, 4);
        let mut injector = FaultInjector::new();
        injector.degrade_test(&mut array, &mut gen, 4, true)?;
        assert_eq!(gen.sink().statuses(), vec!["Degraded sim0", "Recovered sim0"]);
        Ok(())
    }

    #[test]
    fn test_data_survives_degrade_and_recover() -> Result<()> {
        let (mut array, mut gen) = setup(RaidLevel::Raid6, 4);
        // above every random write
        let sector = 16_000;
        gen.write_test(sector, b'K', 64 << 10)?;

        let mut injector = FaultInjector::new();
        injector.degrade_test(&mut array, &mut gen, 10, false)?;

        assert!(read(&mut gen, sector * 512, 64 << 10).iter().all(|&b| b == b'K'));
        assert!(array
            .member_states()?
            .iter()
            .all(|(_, state)| *state == MemberState::InSync));
        Ok(())
    }

    #[test]
    fn test_grow_three_times() -> Result<()> {
        let (mut array, mut gen) = setup(RaidLevel::Raid5, 3);
        let before = array.capacity()?;
        gen.write_test(16_000, b'P', 4096)?;

        let mut injector = FaultInjector::new();
        injector.grow_tests(&mut array, &mut gen, 4, false)?;

        assert_eq!(
            gen.sink().statuses(),
            vec![
                "Grew array to 4 disks",
                "Grew array to 5 disks",
                "Grew array to 6 disks",
            ]
        );
        assert_eq!(array.get_disks()?.len(), 6);
        assert!(read(&mut gen, 16_000 * 512, 4096).iter().all(|&b| b == b'P'));

        // the new capacity is writable
        let past_old_end = before / 512 + 8;
        gen.write_test(past_old_end, b'N', 4096)?;
        Ok(())
    }

    #[test]
    fn test_first_grow_run_uses_shifted_fill() -> Result<()> {
        let (mut array, mut gen) = setup(RaidLevel::Raid5, 3);
        FaultInjector::new().grow_tests(&mut array, &mut gen, 3, true)?;

        let lines = gen.sink().lines();
        assert_eq!(lines[0], "Grew array to 4 disks");
        assert!(lines[1].ends_with("b'0'"));
        assert!(lines[2].ends_with("b'1'"));
        assert!(lines[3].ends_with("b'2'"));
        assert_eq!(lines.len(), 4);
        Ok(())
    }

    #[test]
    fn test_dual_parity_skips_third_grow() -> Result<()> {
        let (mut array, mut gen) = setup(RaidLevel::Raid6, 4);
        let mut injector = FaultInjector::new();
        injector.grow_tests(&mut array, &mut gen, 2, false)?;

        assert_eq!(gen.sink().statuses().len(), 2);
        assert_eq!(array.get_disks()?.len(), 6);
        let grows = injector
            .history()
            .iter()
            .filter(|h| **h == ArrayHealth::Growing)
            .count();
        assert_eq!(grows, 2);
        Ok(())
    }

    #[test]
    fn test_illegal_transitions_are_refused() {
        let mut injector = FaultInjector::new();
        assert!(injector.enter(ArrayHealth::Recovering("sim0".to_string())).is_err());
        injector.enter(ArrayHealth::Degraded("sim0".to_string())).unwrap();
        assert!(injector.enter(ArrayHealth::Degraded("sim1".to_string())).is_err());
        assert!(injector.enter(ArrayHealth::Recovering("sim1".to_string())).is_err());
        assert!(injector.enter(ArrayHealth::Growing).is_err());
        injector.enter(ArrayHealth::Recovering("sim0".to_string())).unwrap();
        assert_eq!(injector.health().to_string(), "recovering(sim0)");
    }
