use crate::common::{RecordRef, CHANGE_EVENT};
use crate::errors::{BonsaiError, BonsaiResult, ErrorKind};
use anyhow::Error;
use basu::error::BasuError;
use basu::event::Event;
use basu::{EventBus, Handle, HandlerId};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Kind of change made to a rid bag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Add,
    Remove,
}

/// A single add or remove of a record, published after the bag was mutated.
#[derive(Clone, Debug)]
pub struct RidBagChangeEvent {
    change_type: ChangeType,
    record: RecordRef,
}

impl RidBagChangeEvent {
    pub fn new(change_type: ChangeType, record: RecordRef) -> Self {
        RidBagChangeEvent {
            change_type,
            record,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    pub fn record(&self) -> &RecordRef {
        &self.record
    }
}

/// Callback invoked for each change event of a rid bag.
pub trait RidBagChangeCallback: Send + Sync + Fn(RidBagChangeEvent) -> BonsaiResult<()> {}

impl<F> RidBagChangeCallback for F where F: Send + Sync + Fn(RidBagChangeEvent) -> BonsaiResult<()> {}

/// Listener registered through [`RidBag::add_change_listener`](crate::ridbag::RidBag::add_change_listener).
///
/// # Usage
///
/// ```ignore
/// let token = bag.add_change_listener(RidBagChangeListener::new(|event| {
///     println!("{:?} {:?}", event.change_type(), event.record());
///     Ok(())
/// }))?;
/// ```
#[derive(Clone)]
pub struct RidBagChangeListener {
    on_event: Arc<dyn RidBagChangeCallback>,
}

impl RidBagChangeListener {
    pub fn new(on_event: impl RidBagChangeCallback + 'static) -> Self {
        RidBagChangeListener {
            on_event: Arc::new(on_event),
        }
    }
}

impl Handle<RidBagChangeEvent> for RidBagChangeListener {
    fn handle(&self, event: &Event<RidBagChangeEvent>) -> Result<(), BasuError> {
        match (self.on_event)(event.data.clone()) {
            Ok(_) => Ok(()),
            Err(e) => Err(BasuError::HandlerError(Error::from(e))),
        }
    }
}

impl Debug for RidBagChangeListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RidBagChangeListener").finish()
    }
}

/// Token returned by [`RidBag::add_change_listener`](crate::ridbag::RidBag::add_change_listener).
pub struct SubscriberRef {
    id: HandlerId,
}

/// The listeners of one rid bag, on a `basu` bus under [`CHANGE_EVENT`].
pub(crate) struct ChangeListeners {
    bus: EventBus<RidBagChangeEvent>,
}

impl ChangeListeners {
    pub(crate) fn new() -> Self {
        ChangeListeners { bus: EventBus::new() }
    }

    pub(crate) fn register(&self, listener: RidBagChangeListener) -> BonsaiResult<SubscriberRef> {
        let id = self
            .bus
            .subscribe(CHANGE_EVENT, Box::new(listener))
            .map_err(listener_error)?;
        Ok(SubscriberRef { id })
    }

    pub(crate) fn deregister(&self, subscriber: SubscriberRef) -> BonsaiResult<()> {
        self.bus
            .unsubscribe(CHANGE_EVENT, &subscriber.id)
            .map_err(listener_error)?;
        Ok(())
    }

    /// Hands `event` to every listener. The first failing listener aborts
    /// the fan-out.
    pub(crate) fn publish(&self, event: RidBagChangeEvent) -> BonsaiResult<()> {
        if self.is_empty() {
            return Ok(());
        }
        self.bus
            .publish(CHANGE_EVENT, &Event::new(event))
            .map_err(listener_error)?;
        Ok(())
    }

    pub(crate) fn clear(&self) -> BonsaiResult<()> {
        self.bus.clear().map_err(listener_error)?;
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self.bus.get_handler_count(CHANGE_EVENT) {
            Ok(count) => count == 0,
            // the event type only exists once somebody subscribed
            Err(BasuError::EventTypeNotFOUND) => true,
            Err(e) => {
                log::warn!("Could not count rid bag listeners: {}", e);
                true
            }
        }
    }
}

fn listener_error(e: BasuError) -> BonsaiError {
    let message = match e {
        BasuError::HandlerError(cause) => format!("Rid bag listener failed: {}", cause),
        other => format!("Rid bag listener registry failed: {}", other),
    };
    BonsaiError::new(&message, ErrorKind::EventError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RecordId;

    #[test]
    fn test_listener_forwards_event() {
        let listener = RidBagChangeListener::new(|event: RidBagChangeEvent| {
            assert_eq!(event.change_type(), ChangeType::Add);
            assert_eq!(event.record().identity(), RecordId::new(2, 7));
            Ok(())
        });
        let event = Event::new(RidBagChangeEvent::new(
            ChangeType::Add,
            RecordRef::new(RecordId::new(2, 7)),
        ));
        assert!(listener.handle(&event).is_ok());
    }

    #[test]
    fn test_listener_error_becomes_handler_error() {
        let listener = RidBagChangeListener::new(|_| {
            Err(BonsaiError::new("rejected", ErrorKind::InvalidOperation))
        });
        let event = Event::new(RidBagChangeEvent::new(
            ChangeType::Remove,
            RecordRef::unsaved(),
        ));
        match listener.handle(&event) {
            Err(BasuError::HandlerError(e)) => assert!(e.to_string().contains("rejected")),
            _ => panic!("expected a handler error"),
        }
    }

    #[test]
    fn test_registry_fans_out_until_deregistered() {
        let listeners = ChangeListeners::new();
        assert!(listeners.is_empty());
        listeners
            .publish(RidBagChangeEvent::new(ChangeType::Add, RecordRef::unsaved()))
            .unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let token = listeners
            .register(RidBagChangeListener::new(move |event: RidBagChangeEvent| {
                sink.lock().push(event.change_type());
                Ok(())
            }))
            .unwrap();
        assert!(!listeners.is_empty());
        listeners
            .publish(RidBagChangeEvent::new(ChangeType::Remove, RecordRef::unsaved()))
            .unwrap();
        assert_eq!(*seen.lock(), vec![ChangeType::Remove]);

        listeners.deregister(token).unwrap();
        assert!(listeners.is_empty());
        listeners
            .publish(RidBagChangeEvent::new(ChangeType::Add, RecordRef::unsaved()))
            .unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_failing_listener_is_an_event_error() {
        let listeners = ChangeListeners::new();
        listeners
            .register(RidBagChangeListener::new(|_| {
                Err(BonsaiError::new("vetoed", ErrorKind::InvalidOperation))
            }))
            .unwrap();
        let err = listeners
            .publish(RidBagChangeEvent::new(ChangeType::Add, RecordRef::unsaved()))
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::EventError);
        assert!(err.to_string().contains("vetoed"));

        listeners.clear().unwrap();
        assert!(listeners.is_empty());
    }
}
