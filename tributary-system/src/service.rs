use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

/// The default bound of a service's inbound channel.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

/// A message interface for [services](Service).
///
/// Most commonly, this interface is an enumeration of messages, but it can
/// also be implemented on a single message. For each individual message, this
/// type needs to implement the [`FromMessage`] trait.
pub trait Interface: Send + 'static {}

/// Services without messages can use `()` as their interface.
impl Interface for () {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send message to service")
    }
}

impl std::error::Error for SendError {}

/// An error when [enqueueing](Addr::try_send) a message without waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The service's inbound channel is at capacity.
    Overloaded,
    /// The service has stopped and no longer receives messages.
    Closed,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overloaded => write!(f, "service inbound queue is full"),
            Self::Closed => write!(f, "service has stopped"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Response behavior of an [`Interface`] message.
///
/// It defines how a service responds to interface messages: through an
/// asynchronous response or fire-and-forget without responding.
/// [`FromMessage`] implementations declare this behavior on the interface.
pub trait MessageResponse {
    /// Sends responses from the service back to the waiting recipient.
    type Sender;

    /// The type returned from [`Addr::send`].
    type Output;

    /// Returns the response channel for an interface message.
    fn channel() -> (Self::Sender, Self::Output);
}

/// Message response resulting in an asynchronous [`ResponseFuture`].
///
/// The sender must be placed on the interface in [`FromMessage::from_message`].
pub struct AsyncResponse<T>(std::marker::PhantomData<T>);

impl<T> fmt::Debug for AsyncResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResponse")
    }
}

/// Sends a message response from a service back to the waiting [`ResponseFuture`].
///
/// The sender is part of an [`Interface`] and should be moved into the service
/// interface type. If this sender is dropped without calling [`send`](Self::send),
/// the request fails with [`SendError`].
#[derive(Debug)]
pub struct Sender<T>(oneshot::Sender<T>);

impl<T> Sender<T> {
    /// Sends the response value and closes the request.
    ///
    /// The response is silently dropped if the requester is no longer
    /// interested in it.
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }
}

/// The future returned from sending a message with an [`AsyncResponse`].
///
/// Resolves to the response value, or [`SendError`] if the service dropped the
/// [`Sender`] without responding.
#[derive(Debug)]
pub struct ResponseFuture<T>(oneshot::Receiver<T>);

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map_err(|_| SendError)
    }
}

impl<T: Send + 'static> MessageResponse for AsyncResponse<T> {
    type Sender = Sender<T>;
    type Output = ResponseFuture<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (Sender(tx), ResponseFuture(rx))
    }
}

/// Message response for fire-and-forget messages with no reply.
#[derive(Debug)]
pub struct NoResponse;

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// Declares a message as part of an [`Interface`].
///
/// Messages have an associated `Response` behavior, either [`NoResponse`] for
/// fire-and-forget messages or [`AsyncResponse<T>`] for request/response
/// style communication.
pub trait FromMessage<M>: Interface {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// The address of a [`Service`].
///
/// Addresses allow message submission into the service's bounded inbound
/// channel. They can be freely cloned; once the service stops, sending
/// returns errors.
#[derive(Debug)]
pub struct Addr<I: Interface> {
    tx: mpsc::Sender<I>,
}

impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<I: Interface> Addr<I> {
    /// Sends a message, waiting for channel capacity if necessary.
    ///
    /// For messages with an [`AsyncResponse`], the returned output is a
    /// [`ResponseFuture`] that must be awaited separately.
    pub async fn send<M>(
        &self,
        message: M,
    ) -> Result<<<I as FromMessage<M>>::Response as MessageResponse>::Output, SendError>
    where
        I: FromMessage<M>,
    {
        let (sender, output) = <I as FromMessage<M>>::Response::channel();
        self.tx
            .send(I::from_message(message, sender))
            .await
            .map_err(|_| SendError)?;
        Ok(output)
    }

    /// Enqueues a message without waiting.
    ///
    /// Fails with [`EnqueueError::Overloaded`] when the inbound channel is at
    /// capacity. The caller decides whether to drop, retry, or block.
    pub fn try_send<M>(
        &self,
        message: M,
    ) -> Result<<<I as FromMessage<M>>::Response as MessageResponse>::Output, EnqueueError>
    where
        I: FromMessage<M>,
    {
        let (sender, output) = <I as FromMessage<M>>::Response::channel();
        self.tx
            .try_send(I::from_message(message, sender))
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Overloaded,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            })?;
        Ok(output)
    }
}

/// Inbound channel of a [`Service`].
///
/// This channel is provided to the service in [`Service::spawn_handler`].
#[derive(Debug)]
pub struct Receiver<I: Interface> {
    rx: mpsc::Receiver<I>,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next message, or `None` once all [`Addr`]s are dropped.
    pub async fn recv(&mut self) -> Option<I> {
        self.rx.recv().await
    }
}

/// Creates a bounded channel for communicating with a [`Service`].
pub fn channel<I: Interface>(capacity: usize) -> (Addr<I>, Receiver<I>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Addr { tx }, Receiver { rx })
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to their [`Interface`] through a
/// bounded channel and handle them one by one on a dedicated task. The
/// implementor spawns that task in [`spawn_handler`](Self::spawn_handler);
/// the task ends when the receiver yields `None`, that is, when all addresses
/// are dropped.
pub trait Service: Sized {
    /// The messages handled by this service.
    type Interface: Interface;

    /// Spawns a task to handle service messages.
    fn spawn_handler(self, rx: Receiver<Self::Interface>);

    /// Starts the service with the default channel bound.
    fn start(self) -> Addr<Self::Interface> {
        self.start_with_capacity(DEFAULT_QUEUE_SIZE)
    }

    /// Starts the service with an explicit channel bound.
    fn start_with_capacity(self, capacity: usize) -> Addr<Self::Interface> {
        let (addr, rx) = channel(capacity);
        self.spawn_handler(rx);
        addr
    }
}
