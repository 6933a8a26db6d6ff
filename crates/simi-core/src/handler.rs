use crate::{SimCore, SimDriver, SimEvent, SimEventResponse};

/// A consumer of simulator callbacks.
///
/// [`SimCore::run`] hands every event to [`handle_event`] and stops as soon
/// as [`check_completion`] returns an output. Handlers that watch forever
/// keep the default and are stopped by the simulator instead.
///
/// [`handle_event`]: Self::handle_event
/// [`check_completion`]: Self::check_completion
pub trait SimHandler<Driver>
where
    Driver: SimDriver,
{
    /// Produced once the handler is done.
    type Output;

    /// Reacts to one event. The returned response is applied before the
    /// simulator resumes.
    fn handle_event(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
    ) -> SimEventResponse<Driver::Architecture>;

    /// Polled after every event.
    fn check_completion(&self) -> Option<Self::Output> {
        None
    }
}
