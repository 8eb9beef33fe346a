use crate::context::Context;
use crate::event_stream::AssistantMessageEventStream;
use crate::model::Model;
use crate::options::StreamOptions;

/// Turns one model call into an assistant event stream.
///
/// The returned stream always ends with exactly one `done` or `error` event,
/// even when the call fails before any network traffic.
pub trait StreamProvider: Send + Sync {
    fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> AssistantMessageEventStream;
}

impl<F> StreamProvider for F
where
    F: Fn(&Model, &Context, &StreamOptions) -> AssistantMessageEventStream + Send + Sync,
{
    fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> AssistantMessageEventStream {
        self(model, context, options)
    }
}
