// moved from src/redundancy.rs
use super::*;

    fn stripe(codec: &StripeCodec, fill: &[u8]) -> Vec<Vec<u8>> {
        let mut shards: Vec<Vec<u8>> = fill.iter().map(|&b| vec![b; 64]).collect();
        shards.resize(codec.total_shards(), vec![0u8; 64]);
        codec.encode(&mut shards).unwrap();
        shards
    }

    #[test]
    fn test_single_parity_rebuilds_any_member() {
        let codec = StripeCodec::for_level(RaidLevel::Raid5, 4).unwrap();
        assert_eq!(codec.data_shards(), 3);
        let shards = stripe(&codec, &[1, 2, 3]);

        for lost in 0..4 {
            let mut partial: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
            partial[lost] = None;
            codec.reconstruct(&mut partial).unwrap();
            assert_eq!(partial[lost].as_ref().unwrap(), &shards[lost]);
        }
    }

    #[test]
    fn test_dual_parity_survives_two_losses() {
        let codec = StripeCodec::for_level(RaidLevel::Raid6, 6).unwrap();
        let shards = stripe(&codec, &[9, 8, 7, 6]);

        let mut partial: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        partial[1] = None;
        partial[4] = None;
        codec.reconstruct(&mut partial).unwrap();
        assert_eq!(partial[1].as_ref().unwrap(), &vec![8u8; 64]);

        partial[0] = None;
        partial[2] = None;
        partial[3] = None;
        assert!(codec.reconstruct(&mut partial).is_err());
    }

    #[test]
    fn test_mirror_copies() {
        let codec = StripeCodec::for_level(RaidLevel::Raid1, 3).unwrap();
        assert_eq!(codec.data_shards(), 1);
        let shards = stripe(&codec, &[0x42]);
        let mut partial = vec![None, None, Some(shards[2].clone())];
        codec.reconstruct(&mut partial).unwrap();
        assert_eq!(partial[0].as_ref().unwrap(), &vec![0x42u8; 64]);
    }

    #[test]
    fn test_striping_without_parity() {
        let codec = StripeCodec::for_level(RaidLevel::Raid0, 2).unwrap();
        let mut shards = vec![vec![1u8; 8], vec![2u8; 8]];
        codec.encode(&mut shards).unwrap();
        assert_eq!(shards, vec![vec![1u8; 8], vec![2u8; 8]]);

        let mut partial = vec![Some(vec![1u8; 8]), None];
        assert!(codec.reconstruct(&mut partial).is_err());
        assert!(codec.encode(&mut [vec![0u8; 8]]).is_err());
    }
