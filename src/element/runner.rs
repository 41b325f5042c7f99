//! The per-element worker thread.
//!
//! One thread per element, spawned on first `run` and living until
//! terminate. Between runs (after a stop, a clean finish or an error) the
//! thread parks on the control token waiting for a fresh run request.

use super::{Directive, ElementInner, ElementState, ProcCtx, Processor, Progress};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// How one run of the stage ended.
enum StageEnd {
    State(ElementState),
    Terminated,
}

pub(crate) fn spawn(inner: Arc<ElementInner>) -> Result<JoinHandle<()>> {
    let thread = inner.thread_config();
    let mut builder = std::thread::Builder::new().name(inner.name().to_string());
    if let Some(stack) = thread.stack_size {
        builder = builder.stack_size(stack);
    }
    if thread.priority.is_some() || thread.affinity.is_some() {
        info!(
            element = %inner.name(),
            priority = ?thread.priority,
            affinity = ?thread.affinity,
            "thread priority/affinity hints recorded (not enforced)"
        );
    }
    let handle = builder.spawn(move || worker_main(inner))?;
    Ok(handle)
}

fn worker_main(inner: Arc<ElementInner>) {
    debug!(element = %inner.name(), "worker started");

    let Some(mut processor) = inner.take_processor() else {
        warn!(element = %inner.name(), "worker spawned twice, exiting");
        return;
    };

    let mut seen_epoch = 0u64;
    loop {
        let Some(epoch) = inner.token().wait_new_run(seen_epoch) else {
            break;
        };
        seen_epoch = epoch;

        inner.transition(ElementState::Running);
        let mut ctx = inner.make_ctx();
        let end = run_stage(&inner, processor.as_mut(), &mut ctx);
        match end {
            StageEnd::State(state) => inner.transition(state),
            StageEnd::Terminated => break,
        }
    }

    if !inner.token().state().is_terminal() {
        inner.transition(ElementState::Stopped);
    }
    debug!(element = %inner.name(), "worker exited");
}

fn run_stage(
    inner: &ElementInner,
    processor: &mut dyn Processor,
    ctx: &mut ProcCtx,
) -> StageEnd {
    if let Err(e) = processor.open(ctx) {
        error!(element = %inner.name(), error = %e, "open failed");
        return StageEnd::State(ElementState::Error);
    }

    let end = work_loop(inner, processor, ctx);

    if let Err(e) = processor.close() {
        warn!(element = %inner.name(), error = %e, "close failed");
    }
    end
}

fn work_loop(
    inner: &ElementInner,
    processor: &mut dyn Processor,
    ctx: &mut ProcCtx,
) -> StageEnd {
    loop {
        match inner.token().directive() {
            Directive::Run => {}
            Directive::Pause => {
                inner.transition(ElementState::Paused);
                match inner.token().wait_directive_change(Directive::Pause) {
                    Directive::Run => inner.transition(ElementState::Running),
                    Directive::Stop => return StageEnd::State(ElementState::Stopped),
                    Directive::Terminate => return StageEnd::Terminated,
                    Directive::Pause => unreachable!("directive changed away from pause"),
                }
            }
            Directive::Stop => return StageEnd::State(ElementState::Stopped),
            Directive::Terminate => return StageEnd::Terminated,
        }

        if let Some(pos) = inner.token().take_seek() {
            if let Err(e) = processor.seek(pos) {
                warn!(element = %inner.name(), pos, error = %e, "seek ignored");
            }
        }

        match processor.process(ctx) {
            Ok(Progress::Advanced) => {}
            Ok(Progress::Finished) => {
                ctx.finish_downstream();
                return StageEnd::State(ElementState::Finished);
            }
            // Transient: nothing to do yet, loop back through the control
            // check and try again.
            Err(Error::Timeout) => {}
            Err(Error::Aborted) => match inner.token().directive() {
                Directive::Stop => return StageEnd::State(ElementState::Stopped),
                Directive::Terminate => return StageEnd::Terminated,
                _ => {
                    // A peer tore the stream down underneath us.
                    debug!(element = %inner.name(), "port aborted, stopping");
                    return StageEnd::State(ElementState::Stopped);
                }
            },
            Err(e) => {
                error!(element = %inner.name(), error = %e, "processing failed");
                return StageEnd::State(ElementState::Error);
            }
        }
    }
}
