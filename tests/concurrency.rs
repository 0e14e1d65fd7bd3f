//! calls into hooked functions from many threads, and from the callbacks themselves.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
};

use region::{Allocation, Protection};
use waylay::{Callbacks, Session};

/// serializes the tests of this file, which patch code.
static PATCHING: Mutex<()> = Mutex::new(());

// mov rax, rdi; add rax, 42; ret
const ADD_42: &[u8] = &[0x48, 0x89, 0xf8, 0x48, 0x83, 0xc0, 0x2a, 0xc3];

// mov rax, rdi; imul rax, rax, 3; ret
const TIMES_3: &[u8] = &[0x48, 0x89, 0xf8, 0x48, 0x6b, 0xc0, 0x03, 0xc3];

// a 15 byte nop, then lea rax, [rdi + 42]; ret
// no instruction other than the first one starts within the longest patch, so a call may start at any time.
const PADDED_ADD_42: &[u8] = &[
    0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x2e, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00, // nop
    0x48, 0x8d, 0x47, 0x2a, 0xc3,
];

fn jit(code: &[u8]) -> (Allocation, extern "C" fn(u64) -> u64) {
    let mut alloc = region::alloc(region::page::size(), Protection::READ_WRITE).unwrap();
    unsafe {
        std::ptr::write_bytes(alloc.as_mut_ptr::<u8>(), 0xcc, alloc.len());
        std::ptr::copy_nonoverlapping(code.as_ptr(), alloc.as_mut_ptr::<u8>(), code.len());
        region::protect(alloc.as_ptr::<u8>(), alloc.len(), Protection::READ_EXECUTE).unwrap();
    }
    let function = unsafe { std::mem::transmute(alloc.as_ptr::<u8>()) };
    (alloc, function)
}

#[test]
fn every_call_from_every_thread_is_observed() {
    let _lock = PATCHING.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    let (_code, add_42) = jit(ADD_42);
    let session = Session::open();

    let (enters, leaves) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let listener = {
        let (enters, leaves) = (enters.clone(), leaves.clone());
        Callbacks::new()
            .on_enter(move |ctx| {
                ctx.set_data((thread::current().id(), ctx.arg(0).unwrap().value()));
                enters.fetch_add(1, Ordering::SeqCst);
            })
            .on_leave(move |ctx| {
                let (thread_id, arg) = *ctx.data::<(thread::ThreadId, u64)>().unwrap();
                assert_eq!(thread_id, thread::current().id());
                assert_eq!(ctx.return_value().unwrap().to_u64(), arg + 42);
                leaves.fetch_add(1, Ordering::SeqCst);
            })
    };
    let handle = unsafe { session.attach(add_42 as usize, listener) }.unwrap();

    thread::scope(|scope| {
        for thread_index in 0..8u64 {
            scope.spawn(move || {
                for i in 0..2000 {
                    let arg = thread_index << 32 | i;
                    assert_eq!(add_42(arg), arg + 42);
                }
            });
        }
    });

    assert_eq!(enters.load(Ordering::SeqCst), 16_000);
    assert_eq!(leaves.load(Ordering::SeqCst), 16_000);
    let stats = session.stats(handle).unwrap();
    assert_eq!(stats.calls, 16_000);
    assert_eq!(stats.faults, 0);
    assert_eq!(stats.in_flight, 0);
}

#[test]
fn hooked_calls_made_by_callbacks_are_not_observed() {
    let _lock = PATCHING.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let (_add_code, add_42) = jit(ADD_42);
    let (_times_code, times_3) = jit(TIMES_3);
    let session = Session::open();

    let times_3_calls = Arc::new(AtomicUsize::new(0));
    let listener = {
        let calls = times_3_calls.clone();
        Callbacks::new().on_enter(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    unsafe { session.attach(times_3 as usize, listener) }.unwrap();

    let listener = Callbacks::new().on_leave(move |ctx| {
        let returned = ctx.return_value().unwrap().to_u64();
        ctx.replace_return_value(times_3(returned)).unwrap();
    });
    unsafe { session.attach(add_42 as usize, listener) }.unwrap();

    assert_eq!(add_42(1), 129);
    assert_eq!(times_3_calls.load(Ordering::SeqCst), 0);
    assert_eq!(times_3(2), 6);
    assert_eq!(times_3_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn hooks_come_and_go_while_threads_call() {
    let _lock = PATCHING.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let (_code, add_42) = jit(PADDED_ADD_42);
    let session = Session::open();
    let (enters, leaves) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let wrong_results = Arc::new(AtomicUsize::new(0));
    let stop = AtomicBool::new(false);

    let calls = thread::scope(|scope| {
        let callers: Vec<_> = (0..4u64)
            .map(|thread_index| {
                let stop = &stop;
                scope.spawn(move || {
                    let mut calls = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        let arg = thread_index << 32 | calls;
                        assert_eq!(add_42(arg), arg + 42);
                        calls += 1;
                    }
                    calls
                })
            })
            .collect();

        for _ in 0..200 {
            let listener = {
                let (enters, leaves, wrong_results) =
                    (enters.clone(), leaves.clone(), wrong_results.clone());
                Callbacks::new()
                    .on_enter(move |_| {
                        enters.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_leave(move |ctx| {
                        let arg = ctx.arg(0).unwrap().value();
                        if ctx.return_value().unwrap().to_u64() != arg + 42 {
                            wrong_results.fetch_add(1, Ordering::SeqCst);
                        }
                        leaves.fetch_add(1, Ordering::SeqCst);
                    })
            };
            let handle = unsafe { session.attach(add_42 as usize, listener) }.unwrap();
            thread::yield_now();
            session.detach(handle).unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        callers
            .into_iter()
            .map(|caller| caller.join().unwrap())
            .sum::<u64>()
    });

    assert!(calls > 0);
    assert_eq!(enters.load(Ordering::SeqCst), leaves.load(Ordering::SeqCst));
    assert_eq!(wrong_results.load(Ordering::SeqCst), 0);
    let restored = unsafe { std::slice::from_raw_parts(add_42 as usize as *const u8, PADDED_ADD_42.len()) };
    assert_eq!(restored, PADDED_ADD_42);
}

#[test]
fn callbacks_can_use_the_session_while_it_patches() {
    let _lock = PATCHING.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let session = Arc::new(Session::open());
    let read_hook = Arc::new(OnceLock::new());
    let queries = Arc::new(AtomicUsize::new(0));
    let listener = {
        let (session, read_hook, queries) =
            (Arc::downgrade(&session), read_hook.clone(), queries.clone());
        Callbacks::new().on_enter(move |_| {
            if let (Some(session), Some(&handle)) = (session.upgrade(), read_hook.get()) {
                if session.stats(handle).is_ok() {
                    queries.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
    };
    let read = unsafe { session.attach("read", listener) }.unwrap();
    read_hook.set(read).unwrap();

    // finding room for the code of a hook reads /proc/self/maps on this thread.
    let (_code, add_42) = jit(ADD_42);
    let add_hook = unsafe { session.attach(add_42 as usize, Callbacks::new()) }.unwrap();
    assert_eq!(add_42(1), 43);
    assert_eq!(session.stats(add_hook).unwrap().calls, 1);

    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let mut byte = 0u8;
    unsafe {
        assert_eq!(libc::write(fds[1], b"x".as_ptr().cast(), 1), 1);
        assert_eq!(libc::read(fds[0], (&mut byte as *mut u8).cast(), 1), 1);
    }
    assert_eq!(byte, b'x');
    assert!(queries.load(Ordering::SeqCst) >= 1);

    session.detach_all().unwrap();
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}
