//! Routes driver completion callbacks back to the owning session

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use crossbeam::sync::ShardedLock;
use tracing::trace;

use crate::capture::driver::{FrameCallback, StreamHandle};
use crate::capture::frame::{FrameBuffer, SessionId};

/// Receives the frames completed for one capture session
pub trait FrameHandler: Send + Sync {
    fn frame_received(&self, stream: StreamHandle, buffer: &Arc<FrameBuffer>);
}

/// Dispatches completed buffers by the session id embedded in them.
///
/// The router is what gets handed to the driver as completion callback.
/// It carries no per-frame state; the id stamped into the buffer at
/// announce time is the only routing input.
#[derive(Default)]
pub struct CallbackRouter {
    // read on every frame, written once per session
    sessions: ShardedLock<HashMap<SessionId, Arc<dyn FrameHandler>>>,
}

impl CallbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: SessionId, handler: Arc<dyn FrameHandler>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handler);
    }

    pub fn unregister(&self, id: SessionId) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn is_registered(&self, id: SessionId) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    fn lookup(&self, id: SessionId) -> Option<Arc<dyn FrameHandler>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

impl FrameCallback for CallbackRouter {
    fn frame_done(&self, stream: StreamHandle, buffer: &Arc<FrameBuffer>) {
        let Some(id) = buffer.context() else {
            trace!(index = buffer.index(), "Frame without session context ignored");
            return;
        };

        // handler runs without the registry lock held
        match self.lookup(id) {
            Some(handler) => handler.frame_received(stream, buffer),
            None => trace!(session = id.get(), "Frame for unknown session ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::capture::pool::AlignedBuffer;

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl FrameHandler for Counting {
        fn frame_received(&self, _stream: StreamHandle, _buffer: &Arc<FrameBuffer>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn buffer(context: Option<SessionId>) -> Arc<FrameBuffer> {
        Arc::new(FrameBuffer::new(
            0,
            context,
            AlignedBuffer::new(16, 1).unwrap(),
        ))
    }

    #[test]
    fn routes_by_embedded_session_id() {
        let router = CallbackRouter::new();
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let (a, b) = (SessionId::next(), SessionId::next());
        router.register(a, first.clone());
        router.register(b, second.clone());

        router.frame_done(StreamHandle(1), &buffer(Some(a)));
        router.frame_done(StreamHandle(1), &buffer(Some(a)));
        router.frame_done(StreamHandle(1), &buffer(Some(b)));

        assert_eq!(first.0.load(Ordering::SeqCst), 2);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_or_stale_context_is_a_noop() {
        let router = CallbackRouter::new();
        let handler = Arc::new(Counting::default());
        let id = SessionId::next();
        router.register(id, handler.clone());

        router.frame_done(StreamHandle(1), &buffer(None));
        router.frame_done(StreamHandle(1), &buffer(Some(SessionId::next())));
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);

        assert!(router.unregister(id));
        router.frame_done(StreamHandle(1), &buffer(Some(id)));
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);
        assert!(!router.is_registered(id));
    }
}
