//! hooks libc's `write` and logs its buffer and result, like a frida `Interceptor.attach` script would.

use std::sync::{Arc, Mutex};

use waylay::{AttachOptions, Callbacks, ReturnType, Session, Signature, TypedValue};

/// `write` can only be hooked by one session of the process at a time.
static WRITE_HOOK: Mutex<()> = Mutex::new(());

fn pipe() -> (libc::c_int, libc::c_int) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn prologue(address: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(address as *const u8, 32) }.to_vec()
}

#[test]
fn write_arguments_and_result_are_logged() {
    let _lock = WRITE_HOOK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    let (read_fd, write_fd) = pipe();

    let session = Session::open();
    let write = session.resolver().resolve(None, "write").unwrap();
    assert_eq!(
        write,
        unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"write".as_ptr()) } as usize
    );
    let original = prologue(write);

    let messages = Arc::new(Mutex::new(Vec::new()));
    let listener = {
        let (enter_messages, leave_messages) = (messages.clone(), messages.clone());
        Callbacks::new()
            .on_enter(move |ctx| {
                if ctx.arg(0).unwrap().to_i32() != write_fd {
                    return;
                }
                ctx.set_data(());
                let buff = ctx.arg(1).unwrap().read_utf8_string().unwrap();
                enter_messages
                    .lock()
                    .unwrap()
                    .push(format!("write() buff=\"{}\"", buff));
            })
            .on_leave(move |ctx| {
                if ctx.data::<()>().is_none() {
                    return;
                }
                let size = ctx.return_value().unwrap().to_i32();
                leave_messages
                    .lock()
                    .unwrap()
                    .push(format!("write()) => size={}", size));
            })
    };
    let options = AttachOptions::new().signature(Signature::new(3, ReturnType::I64));
    let handle = unsafe { session.attach_with("write", listener, options) }.unwrap();
    assert_eq!(handle.address(), write);

    let buf = b"hi\n\0";
    let written = unsafe { libc::write(write_fd, buf.as_ptr().cast(), 3) };
    assert_eq!(written, 3);

    let mut received = [0u8; 3];
    let read = unsafe { libc::read(read_fd, received.as_mut_ptr().cast(), received.len()) };
    assert_eq!(read, 3);
    assert_eq!(&received, b"hi\n");

    assert_eq!(
        *messages.lock().unwrap(),
        ["write() buff=\"hi\n\"", "write()) => size=3"]
    );
    assert!(session.stats(handle).unwrap().calls >= 1);
    assert_eq!(session.last_fault(handle).unwrap(), None);

    session.detach(handle).unwrap();
    assert_eq!(prologue(write), original);

    // no longer observed.
    assert_eq!(unsafe { libc::write(write_fd, buf.as_ptr().cast(), 3) }, 3);
    assert_eq!(messages.lock().unwrap().len(), 2);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn failed_writes_report_negative_sizes() {
    let _lock = WRITE_HOOK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let session = Session::open();
    let results = Arc::new(Mutex::new(Vec::new()));
    let listener = {
        let results = results.clone();
        Callbacks::new().on_leave(move |ctx| {
            if ctx.arg(0).unwrap().to_i32() == -1 {
                results.lock().unwrap().push(ctx.return_value().unwrap().value());
            }
        })
    };
    let options = AttachOptions::new().signature(Signature::new(3, ReturnType::I64));
    let handle = unsafe { session.attach_with("write", listener, options) }.unwrap();

    let written = unsafe { libc::write(-1, b"x".as_ptr().cast(), 1) };
    assert_eq!(written, -1);
    session.detach(handle).unwrap();
    assert_eq!(*results.lock().unwrap(), [TypedValue::I64(-1)]);
}
