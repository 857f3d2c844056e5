//! End-to-end scenario: four participants rendezvous at a barrier, then
//! the creator shuts the domain down and every blocked call returns
//! promptly instead of hanging (spec §8, scenarios 5-6).

use std::thread;

use posix_sessions::shm::domain::DomainHandle;

#[test]
fn four_participants_cross_the_barrier() {
    let creator = DomainHandle::setup(4096, 4, 0, None).expect("setup");
    let path = creator.path().to_path_buf();

    let mut handles = Vec::new();
    for rank in 1..4u32 {
        let path = path.clone();
        handles.push(thread::spawn(move || {
            let mut participant = DomainHandle::connect(&path, rank, None).expect("connect");
            assert!(participant.barrier().expect("barrier"));
        }));
    }

    let mut creator = creator;
    assert!(creator.barrier().expect("barrier"));

    for handle in handles {
        handle.join().expect("participant thread panicked");
    }

    creator.free().expect("free");
}

#[test]
fn shutdown_releases_a_blocked_reader() {
    let mut creator = DomainHandle::setup(16, 2, 0, None).expect("setup");
    let path = creator.path().to_path_buf();

    let reader = thread::spawn(move || {
        let mut participant = DomainHandle::connect(&path, 1, None).expect("connect");
        let mut buf = [0u8; 16];
        participant.read(&mut buf).expect("read returns instead of hanging")
    });

    // Give the reader a moment to block on the empty ring before shutdown.
    thread::sleep(std::time::Duration::from_millis(50));
    creator.shutdown().expect("shutdown");

    let n = reader.join().expect("reader thread panicked");
    assert_eq!(n, 0);

    creator.free().expect("free");
}
