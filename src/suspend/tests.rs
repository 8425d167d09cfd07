extern crate std;

use std::{boxed::Box, sync::mpsc, thread, time::Duration};

use super::*;

#[test]
fn nested_sections_release_once() {
    let cs: &'static CriticalSection = Box::leak(Box::new(CriticalSection::new()));

    cs.suspend_all();
    cs.suspend_all();
    unsafe { cs.resume_all() };

    // The outer section is still held
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        cs.suspend_all();
        unsafe { cs.resume_all() };
        tx.send(()).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    // Leaving it lets the other thread in
    unsafe { cs.resume_all() };
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
}

#[test]
fn critical_inside_suspended_section() {
    let cs = CriticalSection::new();
    let _suspended = Suspended::new(&cs);
    assert_eq!(cs.critical(|| 42), 42);
    {
        let _nested = Suspended::new(&cs);
    }
    assert_eq!(cs.critical(|| 43), 43);
}
