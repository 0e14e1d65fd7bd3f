//! logs every call to `write` made by this process.
//!
//! run with `RUST_LOG=debug` to also see what the hooking machinery does.

use std::io::Write;

use log::info;
use waylay::{AttachOptions, Callbacks, ReturnType, Session, Signature};

fn main() -> waylay::Result<()> {
    env_logger::init();

    let session = Session::open();
    let write = session.resolver().resolve_symbol(None, "write")?;
    info!("write is at {:#x} in {}", write.address, write.module.name);

    let listener = Callbacks::new()
        .on_enter(|ctx| {
            // the buffer of `write` is not nul terminated.
            let buff = ctx
                .arg(2)
                .and_then(|count| ctx.arg(1)?.read_bytes(count.value() as usize));
            match buff {
                Ok(buff) => eprintln!("write() buff=\"{}\"", String::from_utf8_lossy(&buff)),
                Err(err) => eprintln!("write() buff=<{}>", err),
            }
        })
        .on_leave(|ctx| {
            if let Ok(size) = ctx.return_value() {
                eprintln!("write()) => size={}", size.to_i32());
            }
        });
    let options = AttachOptions::new().signature(Signature::new(3, ReturnType::I64));
    let handle = unsafe { session.attach_with("write", listener, options) }?;

    let mut stdout = std::io::stdout();
    for line in ["hi", "from", "the demo"] {
        writeln!(stdout, "{}", line).ok();
        stdout.flush().ok();
    }

    let stats = session.stats(handle)?;
    session.detach(handle)?;
    info!("observed {} calls to write", stats.calls);
    Ok(())
}
