//! # Change Notification
//!
//! Every observable change in a form (a value written, a node turning
//! relevant, a repeat instance added, a choice list refreshed) is described
//! by a [`ChangeEvent`] and broadcast on the form's [`EventBus`].
//!
//! ```text
//! ┌──────────┐     ┌──────────┐     ┌──────────┐
//! │   Form   │────▶│ EventBus │────▶│Subscriber│
//! └──────────┘     └──────────┘     └──────────┘
//! ```
//!
//! Events are emitted only when the derived value actually changed, so a
//! subscriber can redraw exactly what the event names.
//!
//! ```rust,no_run
//! # use formcascade::event::EventBus;
//! # async fn example(bus: EventBus) {
//! let mut events = bus.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{} changed at {}[{}]", event.kind, event.path, event.index);
//!     }
//! });
//! # }
//! ```

pub mod event_bus;

pub use event_bus::{ChangeEvent, ChangeKind, EventBus, EventError, EventReceiver, EventResult};
