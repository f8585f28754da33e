//! # comprehensive storage tests
//!
//! why: verify all storage scenarios work correctly
//! relations: tests raft-storage crate against raft-core's durable write queue
//! what: persistence, crash recovery, write queue application, atomic files, edge cases

use raft_core::{DurableWrite, LogEntry, RaftConfig, RaftNode};
use raft_storage::{FileStorage, InMemoryStorage, Storage};
use std::fs;
use tempfile::tempdir;

fn entries(terms: &[u64]) -> Vec<LogEntry> {
    terms
        .iter()
        .enumerate()
        .map(|(i, &term)| LogEntry::new(term, i as u64 + 1, format!("cmd{}", i + 1).into_bytes()))
        .collect()
}

// =============================================================================
// SECTION 1: IN-MEMORY STORAGE TESTS
// =============================================================================

mod in_memory_basic {
    use super::*;

    #[test]
    fn new_storage_has_default_values() {
        let storage = InMemoryStorage::new();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();

        assert_eq!(term, 0);
        assert_eq!(voted_for, None);
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn save_voted_for_none() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(10, None).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();

        assert_eq!(term, 10);
        assert_eq!(voted_for, None);
    }

    #[test]
    fn overwrite_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(1, Some(1)).unwrap();
        storage.save_term_and_vote(5, Some(3)).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (5, Some(3)));
    }

    #[test]
    fn clone_keeps_state_like_a_disk() {
        let mut storage = InMemoryStorage::new();
        storage.save_term_and_vote(3, Some(2)).unwrap();
        storage.append_entries(&entries(&[1, 3])).unwrap();

        let disk = storage.clone();
        drop(storage);

        assert_eq!(disk.load_term_and_vote().unwrap(), (3, Some(2)));
        assert_eq!(disk.load_log().unwrap(), entries(&[1, 3]));
    }
}

mod in_memory_log {
    use super::*;

    #[test]
    fn append_in_batches() {
        let mut storage = InMemoryStorage::new();
        let all = entries(&[1, 1, 2, 2]);

        storage.append_entries(&all[..2]).unwrap();
        storage.append_entries(&all[2..]).unwrap();

        assert_eq!(storage.load_log().unwrap(), all);
    }

    #[test]
    fn append_empty_entries() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(&[1])).unwrap();
        storage.append_entries(&[]).unwrap();

        assert_eq!(storage.load_log().unwrap().len(), 1);
    }

    #[test]
    fn append_overlapping_batch_replaces_suffix() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(&[1, 1, 1, 1])).unwrap();

        let replacement = vec![LogEntry::new(2, 3, b"new".to_vec())];
        storage.append_entries(&replacement).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2], replacement[0]);
    }

    #[test]
    fn truncate_log_from_index() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(&[1, 1, 1, 2, 2])).unwrap();

        storage.truncate_log_from(3).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn truncate_all_entries() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(&[1, 1])).unwrap();

        storage.truncate_log_from(1).unwrap();

        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn truncate_empty_log() {
        let mut storage = InMemoryStorage::new();
        storage.truncate_log_from(1).unwrap();
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn read_log_from_middle() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(&[1, 1, 2])).unwrap();

        let tail = storage.read_log(2).unwrap();
        assert_eq!(tail, entries(&[1, 1, 2])[1..].to_vec());
    }
}

// =============================================================================
// SECTION 2: FILE STORAGE TESTS
// =============================================================================

mod file_storage_basic {
    use super::*;

    #[test]
    fn create_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("node-1");

        let storage = FileStorage::new(&path).unwrap();

        assert!(path.is_dir());
        assert_eq!(storage.dir(), path.as_path());
    }

    #[test]
    fn new_storage_has_default_values() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn save_creates_meta_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(1, Some(1)).unwrap();

        assert!(dir.path().join("meta.json").exists());
    }
}

mod file_storage_log {
    use super::*;

    #[test]
    fn append_creates_log_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&entries(&[1])).unwrap();

        assert!(dir.path().join("log.json").exists());
    }

    #[test]
    fn append_empty_does_not_create_log_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&[]).unwrap();

        assert!(!dir.path().join("log.json").exists());
    }

    #[test]
    fn append_and_load_entries() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&entries(&[1, 2, 2])).unwrap();

        assert_eq!(storage.load_log().unwrap(), entries(&[1, 2, 2]));
    }

    #[test]
    fn append_overlapping_batch_replaces_suffix() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(&[1, 1, 1])).unwrap();

        storage.append_entries(&[LogEntry::new(3, 2, b"x".to_vec())]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].term, 3);
    }

    #[test]
    fn read_log_from_index() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(&[1, 1, 2, 3])).unwrap();

        let tail = storage.read_log(3).unwrap();
        assert_eq!(tail.iter().map(|e| e.term).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn truncate_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(&[1, 1, 2])).unwrap();

        storage.truncate_log_from(2).unwrap();

        assert_eq!(storage.load_log().unwrap(), entries(&[1]));
    }

    #[test]
    fn truncate_past_end_is_noop() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(&[1, 1])).unwrap();

        storage.truncate_log_from(10).unwrap();

        assert_eq!(storage.load_log().unwrap().len(), 2);
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY / PERSISTENCE TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn term_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(42, Some(7)).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (42, Some(7)));
    }

    #[test]
    fn log_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.append_entries(&entries(&[1, 1, 2])).unwrap();
            storage.truncate_log_from(3).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_log().unwrap(), entries(&[1, 1]));
    }

    #[test]
    fn multiple_restarts_preserve_state() {
        let dir = tempdir().unwrap();

        for round in 1..=3u64 {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            let (term, _) = storage.load_term_and_vote().unwrap();
            assert_eq!(term, round - 1);

            let log = storage.load_log().unwrap();
            assert_eq!(log.len() as u64, round - 1);

            storage.save_term_and_vote(round, Some(round)).unwrap();
            storage
                .append_entries(&[LogEntry::new(round, round, vec![round as u8])])
                .unwrap();
        }
    }

    #[test]
    fn node_restores_from_applied_writes() {
        let dir = tempdir().unwrap();

        // a follower accepts a leader's entries and persists what it queued
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            let mut node = RaftNode::new(2, vec![1, 2, 3]);
            let req = raft_core::AppendEntries {
                term: 3,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: entries(&[1, 3]),
                leader_commit: 0,
            };
            let (resp, _) = node.handle_append_entries(&req);
            assert!(resp.success);
            storage.apply(node.take_writes()).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        let node = RaftNode::restore(
            2,
            vec![1, 2, 3],
            RaftConfig::default(),
            term,
            voted_for,
            storage.load_log().unwrap(),
        )
        .unwrap();

        assert_eq!(node.current_term, 3);
        assert_eq!(node.last_log_index(), 2);
        assert_eq!(node.last_log_term(), 3);
        assert_eq!(node.commit_index, 0);
    }

    #[test]
    fn vote_survives_restart_and_blocks_second_vote() {
        let dir = tempdir().unwrap();

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            let mut node = RaftNode::new(1, vec![1, 2, 3]);
            let (resp, _) = node.handle_vote_request(&raft_core::VoteRequest {
                term: 4,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            });
            assert!(resp.vote_granted);
            storage.apply(node.take_writes()).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        let mut node =
            RaftNode::restore(1, vec![1, 2, 3], RaftConfig::default(), term, voted_for, Vec::new())
                .unwrap();

        let (resp, _) = node.handle_vote_request(&raft_core::VoteRequest {
            term: 4,
            candidate_id: 3,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!resp.vote_granted, "restarted voter must remember its vote");
    }
}

// =============================================================================
// SECTION 4: ATOMIC WRITE TESTS
// =============================================================================

mod atomic_writes {
    use super::*;

    #[test]
    fn meta_file_is_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_term_and_vote(5, Some(2)).unwrap();

        let contents = fs::read_to_string(dir.path().join("meta.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["term"], 5);
        assert_eq!(parsed["voted_for"], 2);
    }

    #[test]
    fn log_file_is_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(&[1, 2])).unwrap();

        let contents = fs::read_to_string(dir.path().join("log.json")).unwrap();
        let parsed: Vec<LogEntry> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_term_and_vote(1, None).unwrap();
        storage.append_entries(&entries(&[1, 1])).unwrap();
        storage.truncate_log_from(2).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}

// =============================================================================
// SECTION 5: WRITE QUEUE APPLICATION
// =============================================================================

mod write_queue {
    use super::*;

    #[test]
    fn candidacy_then_leadership_is_persisted() {
        let mut storage = InMemoryStorage::new();
        let mut node = RaftNode::new(1, vec![1, 2, 3]);

        node.start_election();
        node.handle_vote_response(2, &raft_core::VoteResponse { term: 1, vote_granted: true });
        storage.apply(node.take_writes()).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (1, Some(1)));
        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].is_noop());
    }

    #[test]
    fn conflict_resolution_is_persisted() {
        let mut storage = InMemoryStorage::new();
        storage
            .apply(vec![
                DurableWrite::TermAndVote { term: 1, voted_for: None },
                DurableWrite::Append(entries(&[1, 1, 1])),
            ])
            .unwrap();

        let mut node = RaftNode::restore(
            3,
            vec![1, 2, 3],
            RaftConfig::default(),
            1,
            None,
            storage.load_log().unwrap(),
        )
        .unwrap();
        let req = raft_core::AppendEntries {
            term: 2,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![LogEntry::new(2, 2, b"winner".to_vec())],
            leader_commit: 0,
        };
        node.handle_append_entries(&req);
        storage.apply(node.take_writes()).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].command, b"winner".to_vec());
        assert_eq!(storage.load_term_and_vote().unwrap(), (2, None));
    }
}

// =============================================================================
// SECTION 6: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn large_log_entry() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let big = vec![0xAB; 64 * 1024];

        storage.append_entries(&[LogEntry::new(1, 1, big.clone())]).unwrap();

        assert_eq!(storage.load_log().unwrap()[0].command, big);
    }

    #[test]
    fn binary_command_data() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let bytes: Vec<u8> = (0..=255).collect();

        storage.append_entries(&[LogEntry::new(1, 1, bytes.clone())]).unwrap();

        assert_eq!(storage.load_log().unwrap()[0].command, bytes);
    }

    #[test]
    fn very_high_term_number() {
        let mut storage = InMemoryStorage::new();
        storage.save_term_and_vote(u64::MAX, Some(u64::MAX)).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (u64::MAX, Some(u64::MAX)));
    }

    #[test]
    fn corrupt_log_file_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("log.json"), b"[{\"term\":").unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert!(storage.load_log().is_err());
    }
}

// =============================================================================
// SECTION 7: STORAGE TRAIT POLYMORPHISM
// =============================================================================

mod trait_polymorphism {
    use super::*;

    fn exercise<S: Storage>(storage: &mut S) {
        storage.save_term_and_vote(3, Some(1)).unwrap();
        storage.append_entries(&entries(&[1, 2, 3])).unwrap();
        storage.truncate_log_from(3).unwrap();
        storage
            .apply(vec![DurableWrite::Append(vec![LogEntry::new(3, 3, b"c".to_vec())])])
            .unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (3, Some(1)));
        let log = storage.load_log().unwrap();
        assert_eq!(log.iter().map(|e| e.term).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(log[2].command, b"c".to_vec());
    }

    #[test]
    fn in_memory_implements_trait() {
        exercise(&mut InMemoryStorage::new());
    }

    #[test]
    fn file_storage_implements_trait() {
        let dir = tempdir().unwrap();
        exercise(&mut FileStorage::new(dir.path()).unwrap());
    }

    #[test]
    fn boxed_trait_object() {
        let mut storage: Box<dyn Storage> = Box::new(InMemoryStorage::new());
        storage.save_term_and_vote(2, None).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (2, None));
    }
}
