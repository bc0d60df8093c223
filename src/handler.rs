//! Handler contracts and typed argument extraction.
//!
//! A `Handler` receives the decoded positional args; its parameter list is
//! checked at dispatch time via `Args` extraction, so an arity or type
//! mismatch surfaces as a terminal `HandlerSignature` error instead of a
//! retry loop.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::{ArgValue, Codec};
use crate::error::Error;
use crate::message::Message;

/// Decoded positional arguments with typed extraction.
#[derive(Debug, Clone)]
pub struct Args(Vec<ArgValue>);

impl Args {
    pub fn new(values: Vec<ArgValue>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fail unless exactly `n` args were decoded.
    pub fn expect_arity(&self, n: usize) -> Result<(), Error> {
        if self.0.len() == n {
            Ok(())
        } else {
            Err(Error::HandlerSignature(format!(
                "expected {n} args, got {}",
                self.0.len()
            )))
        }
    }

    /// Extract the arg at `idx` as `T`.
    pub fn get<T: FromArg>(&self, idx: usize) -> Result<T, Error> {
        let value = self.0.get(idx).ok_or_else(|| {
            Error::HandlerSignature(format!("missing arg #{idx}, got {} args", self.0.len()))
        })?;
        T::from_arg(value).map_err(|want| {
            Error::HandlerSignature(format!(
                "arg #{idx}: expected {want}, got {}",
                value.kind()
            ))
        })
    }

    pub fn values(&self) -> &[ArgValue] {
        &self.0
    }
}

/// Conversion from a decoded value into a concrete parameter type.
///
/// The error value is the expected kind, used to build the mismatch message.
pub trait FromArg: Sized {
    fn from_arg(value: &ArgValue) -> Result<Self, &'static str>;
}

impl FromArg for String {
    fn from_arg(value: &ArgValue) -> Result<Self, &'static str> {
        match value {
            ArgValue::Str(s) => Ok(s.clone()),
            _ => Err("str"),
        }
    }
}

impl FromArg for i64 {
    fn from_arg(value: &ArgValue) -> Result<Self, &'static str> {
        match value {
            ArgValue::Int(v) => Ok(*v),
            ArgValue::Uint(v) => i64::try_from(*v).map_err(|_| "int"),
            _ => Err("int"),
        }
    }
}

impl FromArg for u64 {
    fn from_arg(value: &ArgValue) -> Result<Self, &'static str> {
        match value {
            ArgValue::Uint(v) => Ok(*v),
            ArgValue::Int(v) => u64::try_from(*v).map_err(|_| "uint"),
            _ => Err("uint"),
        }
    }
}

impl FromArg for u32 {
    fn from_arg(value: &ArgValue) -> Result<Self, &'static str> {
        let v: u64 = FromArg::from_arg(value)?;
        u32::try_from(v).map_err(|_| "uint")
    }
}

impl FromArg for f64 {
    fn from_arg(value: &ArgValue) -> Result<Self, &'static str> {
        match value {
            ArgValue::Float(v) => Ok(*v),
            _ => Err("float"),
        }
    }
}

impl FromArg for bool {
    fn from_arg(value: &ArgValue) -> Result<Self, &'static str> {
        match value {
            ArgValue::Bool(v) => Ok(*v),
            _ => Err("bool"),
        }
    }
}

impl FromArg for Vec<u8> {
    fn from_arg(value: &ArgValue) -> Result<Self, &'static str> {
        match value {
            ArgValue::Bytes(b) => Ok(b.clone()),
            _ => Err("bytes"),
        }
    }
}

impl Args {
    /// Extract the arg at `idx` as a homogeneous sequence of `T`.
    pub fn get_list<T: FromArg>(&self, idx: usize) -> Result<Vec<T>, Error> {
        let value = self.0.get(idx).ok_or_else(|| {
            Error::HandlerSignature(format!("missing arg #{idx}, got {} args", self.0.len()))
        })?;
        let ArgValue::List(items) = value else {
            return Err(Error::HandlerSignature(format!(
                "arg #{idx}: expected list, got {}",
                value.kind()
            )));
        };
        items
            .iter()
            .map(T::from_arg)
            .collect::<Result<Vec<T>, _>>()
            .map_err(|want| {
                Error::HandlerSignature(format!("arg #{idx}: expected list of {want}"))
            })
    }
}

/// User handler: receives the decoded args, returns the outcome.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, args: Args) -> Result<(), Error>;
}

/// Last-chance handler invoked when retries are exhausted or on terminal
/// decode failure. Takes no args.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn call(&self) -> Result<(), Error>;
}

/// Internal dispatch seam: stage queues inside a backend shell handle the
/// whole message (they forward bodies, not decoded args).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn call(&self, msg: &Message) -> Result<(), Error>;
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn call(&self, args: Args) -> Result<(), Error> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a `Handler`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

struct FallbackFn<F>(F);

#[async_trait]
impl<F, Fut> FallbackHandler for FallbackFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn call(&self) -> Result<(), Error> {
        (self.0)().await
    }
}

/// Wrap an async closure as a `FallbackHandler`.
pub fn fallback_fn<F, Fut>(f: F) -> Arc<dyn FallbackHandler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(FallbackFn(f))
}

pub(crate) struct MessageFn<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for MessageFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn call(&self, msg: &Message) -> Result<(), Error> {
        (self.0)(msg.clone()).await
    }
}

/// Adapts a user `Handler` to the message-level dispatch seam: decodes the
/// body, then invokes the handler with typed args.
pub(crate) struct ArgsDispatch {
    pub handler: Arc<dyn Handler>,
    pub codec: Codec,
}

#[async_trait]
impl MessageHandler for ArgsDispatch {
    async fn call(&self, msg: &Message) -> Result<(), Error> {
        let args = msg.decode_args(self.codec)?;
        self.handler.call(Args::new(args)).await
    }
}
