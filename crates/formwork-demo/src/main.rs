//! Formwork dispatcher demo
//!
//! Drives an address form the way a UI would: field validation runs with
//! high priority and reports back to the field, a slow lookup runs on the
//! normal lane, and a failing save ends up in the global handler.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use formwork_dispatch::{
    ComponentInstance, Controller, DispatchError, Dispatcher, DispatcherConfig, DispatcherStats,
    EventLoop, FailureContext, ParamMap, WorkError, WorkRequest, WorkValue, work_fn,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PACKAGES: u64 = 3;
const WAIT: Duration = Duration::from_secs(10);

struct AddressForm {
    lookups: AtomicUsize,
}

impl Controller for AddressForm {
    fn name(&self) -> &str {
        "address-form"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Input field showing validation feedback
struct Field {
    name: &'static str,
    done: mpsc::Sender<()>,
}

impl ComponentInstance for Field {
    fn on_success(&self) {
        tracing::info!("{}: valid", self.name);
        let _ = self.done.send(());
    }

    fn on_failure(&self, error: WorkError) {
        tracing::info!("{}: invalid ({})", self.name, error);
        let _ = self.done.send(());
    }
}

/// Poll `condition` until it holds or `deadline` passes
fn wait_until(deadline: Instant, mut condition: impl FnMut() -> bool) -> bool {
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn main() -> Result<(), DispatchError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "formwork_dispatch=debug,formwork_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let stats = run(DispatcherConfig::from_env()?)?;
    tracing::info!(
        "Done: {} queued, {} inline, {} completed, {} workers created",
        stats.queued_packages,
        stats.inline_packages,
        stats.completed_packages,
        stats.created_workers
    );
    Ok(())
}

/// Submit the form's work from the UI loop and wait for all of it to finish
fn run(config: DispatcherConfig) -> Result<DispatcherStats, DispatchError> {
    let ui = EventLoop::spawn("formwork-ui")?;
    let handler =
        |controller: &Arc<dyn Controller>, error: WorkError, context: &FailureContext| {
            tracing::warn!(
                "{} failed at item {} ({} priority): {}",
                controller.name(),
                context.index,
                context.priority.name(),
                error
            );
        };
    let dispatcher = Dispatcher::new(config, ui.clone(), Arc::new(handler));
    let form: Arc<dyn Controller> = Arc::new(AddressForm {
        lookups: AtomicUsize::new(0),
    });

    tracing::info!("Formwork {} demo started", formwork_dispatch::VERSION);

    let (done_tx, done_rx) = mpsc::channel();
    let zip = work_fn("validate-zip", |_, params, _| {
        let zip = params.get::<String>("zip").cloned().unwrap_or_default();
        if zip.len() == 5 && zip.chars().all(|c| c.is_ascii_digit()) {
            Ok(Box::new(zip) as WorkValue)
        } else {
            Err(WorkError::msg(format!("{:?} is not a postal code", zip)))
        }
    });
    let lookup = work_fn("lookup-city", |controller, _, _| {
        thread::sleep(Duration::from_millis(50));
        if let Some(form) = controller.as_any().downcast_ref::<AddressForm>() {
            form.lookups.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Box::new("Springfield") as WorkValue)
    });
    let save = work_fn("save", |_, _, _| Err(WorkError::msg("storage offline")));

    let requests = vec![
        WorkRequest::new(form.clone())
            .item(zip.clone())
            .params(ParamMap::new().with("zip", "12345".to_string()))
            .component(Arc::new(Field {
                name: "zip",
                done: done_tx.clone(),
            }))
            .priority(formwork_dispatch::Priority::High)
            .special_success_handling(true),
        WorkRequest::new(form.clone())
            .item(zip)
            .params(ParamMap::new().with("zip", "12a".to_string()))
            .component(Arc::new(Field {
                name: "zip",
                done: done_tx.clone(),
            }))
            .priority(formwork_dispatch::Priority::High)
            .special_success_handling(true),
        WorkRequest::new(form.clone()).item(lookup).skip().item(save),
    ];

    let d = dispatcher.clone();
    ui.invoke_and_wait(move || {
        for request in requests {
            d.submit(request);
        }
    });

    let deadline = Instant::now() + WAIT;

    // Inline runs have no component attached, so feedback only comes from workers
    if dispatcher.uses_worker_threads() {
        for _ in 0..2 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if done_rx.recv_timeout(remaining).is_err() {
                tracing::warn!("Timed out waiting for field feedback");
                break;
            }
        }
    }
    if !wait_until(deadline, || {
        let stats = dispatcher.stats();
        stats.completed_packages + stats.inline_packages >= PACKAGES
    }) {
        tracing::warn!("Timed out waiting for work packages to finish");
    }

    if let Some(form) = form.as_any().downcast_ref::<AddressForm>() {
        tracing::info!("City lookups: {}", form.lookups.load(Ordering::SeqCst));
    }

    let stats = dispatcher.stats();
    dispatcher.shutdown();
    ui.shutdown();
    Ok(stats)
}
