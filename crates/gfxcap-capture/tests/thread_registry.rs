//! Thread-id assignment runs in its own process (each integration-test
//! binary is one), so absolute ids are observable here: dense, starting at
//! 1, in first-touch order.

use gfxcap_capture::current_thread_id;

#[test]
fn ids_are_dense_from_one_in_first_touch_order() {
    assert_eq!(current_thread_id(), 1, "first thread to touch the registry");
    assert_eq!(current_thread_id(), 1, "stable on repeat lookups");

    let second = std::thread::spawn(current_thread_id).join().unwrap();
    let third = std::thread::spawn(current_thread_id).join().unwrap();
    assert_eq!(second, 2);
    assert_eq!(third, 3);

    assert_eq!(current_thread_id(), 1, "unchanged by other threads");
}
