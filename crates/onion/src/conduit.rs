//! Byte conduits
//!
//! The active channel of a session or circuit is a polymorphic byte pipe:
//! initially a raw libp2p stream, then the secured channel after a noise
//! upgrade, nested once per hop. Holding one boxed conduit keeps the
//! circuit object the same shape regardless of depth.

use futures::io::{AsyncRead, AsyncWrite};

/// Anything that can carry overlay frames in both directions.
pub trait Conduit: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conduit for T {}

/// The one-size conduit the session and circuit state machines hold.
pub type BoxConduit = Box<dyn Conduit>;

/// Box any conduit.
pub fn boxed<C: Conduit + 'static>(conduit: C) -> BoxConduit {
    Box::new(conduit)
}
