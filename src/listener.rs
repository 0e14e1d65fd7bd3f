use crate::context::CallContext;

/// receives the calls made to a hooked function.
///
/// both callbacks run on the thread which made the call, synchronously. a listener may be called from many threads at
/// once.
pub trait InvocationListener: Send + Sync {
    /// called when the hooked function is entered, before the original runs.
    fn on_enter(&self, _ctx: &mut CallContext) {}

    /// called after the original returned, or after the enter callback skipped it.
    fn on_leave(&self, _ctx: &mut CallContext) {}
}

type Callback = Box<dyn Fn(&mut CallContext) + Send + Sync>;

/// an [`InvocationListener`] made of a pair of closures.
///
/// ```no_run
/// use waylay::Callbacks;
///
/// let listener = Callbacks::new()
///     .on_enter(|ctx| println!("enter {:?}", ctx.arg(0)))
///     .on_leave(|ctx| println!("leave {:?}", ctx.return_value()));
/// ```
#[derive(Default)]
pub struct Callbacks {
    on_enter: Option<Callback>,
    on_leave: Option<Callback>,
}
impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_enter(mut self, callback: impl Fn(&mut CallContext) + Send + Sync + 'static) -> Self {
        self.on_enter = Some(Box::new(callback));
        self
    }

    pub fn on_leave(mut self, callback: impl Fn(&mut CallContext) + Send + Sync + 'static) -> Self {
        self.on_leave = Some(Box::new(callback));
        self
    }
}
impl InvocationListener for Callbacks {
    fn on_enter(&self, ctx: &mut CallContext) {
        if let Some(callback) = &self.on_enter {
            callback(ctx)
        }
    }

    fn on_leave(&self, ctx: &mut CallContext) {
        if let Some(callback) = &self.on_leave {
            callback(ctx)
        }
    }
}
impl core::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_enter", &self.on_enter.is_some())
            .field("on_leave", &self.on_leave.is_some())
            .finish()
    }
}
