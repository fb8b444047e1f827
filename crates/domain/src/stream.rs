use std::pin::Pin;

/// A boxed async stream. Agents return `BoxStream<'static, Event>` from
/// `Agent::run`; the Event Loop fans it in alongside flush and
/// cancellation.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;
