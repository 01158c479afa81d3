//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::error::ChainError;
    use crate::participant::{Participant, ParticipantRegistry};

    fn registry_with(name: &str, keypair: &KeyPair) -> ParticipantRegistry {
        let mut registry = ParticipantRegistry::new();
        registry
            .register(Participant::new(name, keypair.public_key_bytes().to_vec(), "127.0.0.1", 9000))
            .unwrap();
        registry
    }

    fn utility(participants: Vec<Participant>, shares: Vec<(usize, i64)>) -> UtilityTx {
        let shares = shares
            .into_iter()
            .map(|(i, share)| ParticipantShare {
                participant: participants[i].clone(),
                share,
            })
            .collect();
        UtilityTx::new("alice", "energy", participants, shares).with_timestamp(1_000)
    }

    #[test]
    fn test_transfer_hash_is_deterministic() {
        let tx = TransferTx::new("alice", "bob", "energy", 5).with_timestamp(42);
        assert_eq!(tx.hash(), tx.clone().hash());
    }

    #[test]
    fn test_transfer_hash_ignores_signature_and_external_flag() {
        let keypair = KeyPair::generate();
        let plain = Transaction::from(TransferTx::new("alice", "bob", "energy", 5).with_timestamp(42));
        let mut signed = plain.clone();
        signed.sign(&keypair);
        let external = Transaction::from(TransferTx::new("alice", "bob", "energy", 5).with_timestamp(42).external());

        assert_eq!(plain.hash(), signed.hash());
        assert_eq!(plain.hash(), external.hash());
        assert_ne!(plain, external);
    }

    #[test]
    fn test_transfer_hash_covers_every_content_field() {
        let base = TransferTx::new("alice", "bob", "energy", 5).with_timestamp(42);
        let variants = vec![
            TransferTx { sender: "carol".into(), ..base.clone() },
            TransferTx { receiver: "carol".into(), ..base.clone() },
            TransferTx { asset_name: "water".into(), ..base.clone() },
            TransferTx { timestamp: 43, ..base.clone() },
            TransferTx { amount: 6, ..base.clone() },
            base.clone().with_tag("memo"),
        ];
        for variant in variants {
            assert_ne!(variant.hash(), base.hash());
        }
    }

    #[test]
    fn test_utility_hash_folds_in_participants_and_shares() {
        let alice = Participant::new("alice", vec![2; 33], "10.0.0.1", 9000);
        let bob = Participant::new("bob", vec![3; 33], "10.0.0.2", 9000);

        let base = utility(vec![alice.clone(), bob.clone()], vec![(0, 10), (1, 5)]);
        let other_share = utility(vec![alice.clone(), bob.clone()], vec![(0, 10), (1, 6)]);
        let mut moved_bob = bob.clone();
        moved_bob.port = 9001;
        let other_port = utility(vec![alice, moved_bob], vec![(0, 10), (1, 5)]);

        assert_ne!(base.hash(), other_share.hash());
        assert_ne!(base.hash(), other_port.hash());
    }

    #[test]
    fn test_utility_and_transfer_never_collide() {
        let utility = UtilityTx::new("alice", "energy", vec![], vec![]).with_timestamp(7);
        let transfer = TransferTx {
            sender: "alice".into(),
            receiver: "alice".into(),
            asset_name: "energy".into(),
            timestamp: 7,
            amount: 0,
            signature: None,
            tag: String::new(),
            external: false,
        };
        assert_ne!(utility.hash(), transfer.hash());
    }

    #[test]
    fn test_signature_verification() {
        let keypair = KeyPair::generate();
        let registry = registry_with("alice", &keypair);

        let mut tx = Transaction::from(TransferTx::new("alice", "bob", "energy", 5));
        assert!(!tx.verify_signature(&registry));

        tx.sign(&keypair);
        assert!(tx.verify_signature(&registry));

        if let Transaction::Transfer(inner) = &mut tx {
            inner.amount = 500;
        }
        assert!(!tx.verify_signature(&registry));
    }

    #[test]
    fn test_unknown_sender_fails_verification() {
        let keypair = KeyPair::generate();
        let registry = registry_with("alice", &keypair);

        let mut tx = Transaction::from(TransferTx::new("mallory", "bob", "energy", 5));
        tx.sign(&keypair);
        assert!(!tx.verify_signature(&registry));
    }

    #[test]
    fn test_transfer_shape_checks() {
        assert!(TransferTx::new("alice", "bob", "energy", 1).validate_shape().is_ok());
        assert!(matches!(
            TransferTx::new("alice", "bob", "energy", 0).validate_shape(),
            Err(ChainError::InvalidTransaction(_))
        ));
        assert!(TransferTx::new("alice", "bob", "", 3).validate_shape().is_err());
        assert!(TransferTx::new("alice", "alice", "energy", 3).validate_shape().is_err());
    }

    #[test]
    fn test_utility_shape_checks() {
        let alice = Participant::new("alice", vec![2; 33], "10.0.0.1", 9000);
        let bob = Participant::new("bob", vec![3; 33], "10.0.0.2", 9000);

        assert!(utility(vec![alice.clone(), bob.clone()], vec![(0, 10), (1, 0)])
            .validate_shape()
            .is_ok());
        assert!(utility(vec![alice.clone(), bob.clone()], vec![(0, -1)])
            .validate_shape()
            .is_err());
        assert!(utility(vec![alice.clone(), alice.clone()], vec![])
            .validate_shape()
            .is_err());

        let outsider = UtilityTx::new(
            "alice",
            "energy",
            vec![alice],
            vec![ParticipantShare { participant: bob, share: 3 }],
        );
        assert!(outsider.validate_shape().is_err());
    }
}
