//! Integration tests for the ferric control plane.
//! Full-lifecycle scenarios spanning contexts, connections, sessions, and
//! the async dispatcher.

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use ferric_tls::{
        CacheMode, ConnOptions, EarlyDataDisposition, EarlyDataRead, ProtocolEngine,
        ProtocolMethod, Retry, TlsConnection, TlsContext, TlsError, TlsRole, TlsVersion,
    };

    /// Record layer stand-in with scripted outcomes; unscripted operations
    /// succeed.
    #[derive(Default)]
    struct MockEngine {
        connect: VecDeque<Result<(), TlsError>>,
        accept: VecDeque<Result<(), TlsError>>,
        read: VecDeque<Result<usize, TlsError>>,
        accepted_early: bool,
        finished_early: bool,
    }

    impl ProtocolEngine for MockEngine {
        fn connect(&mut self) -> Result<(), TlsError> {
            self.connect.pop_front().unwrap_or(Ok(()))
        }
        fn accept(&mut self) -> Result<(), TlsError> {
            self.accept.pop_front().unwrap_or(Ok(()))
        }
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TlsError> {
            self.read
                .pop_front()
                .unwrap_or(Err(TlsError::Retry(Retry::WantRead)))
        }
        fn write(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> Result<(), TlsError> {
            Ok(())
        }
        fn shutdown(&mut self) -> Result<(), TlsError> {
            Ok(())
        }
        fn early_data_disposition(&self) -> EarlyDataDisposition {
            if self.accepted_early {
                EarlyDataDisposition::Accepted
            } else {
                EarlyDataDisposition::Rejected
            }
        }
        fn early_data_finished(&self) -> bool {
            self.finished_early
        }
    }

    fn server_ctx() -> Arc<TlsContext> {
        TlsContext::builder()
            .method(ProtocolMethod::Tls)
            .session_id_context(b"interop")
            .build()
            .unwrap()
    }

    // -------------------------------------------------------
    // 1. Accept, cache, resume on a second connection
    // -------------------------------------------------------
    #[test]
    fn test_accept_cache_resume_cycle() {
        let ctx = server_ctx();

        let first = TlsConnection::new(Arc::clone(&ctx), TlsRole::Server);
        first.set_engine(Box::new(MockEngine::default()));
        // Stateful resumption so the server keeps the session.
        first.set_options(ConnOptions::NO_TICKET);
        first.handshake().unwrap();
        assert_eq!(ctx.session_count(), 1);

        let id = first.session().unwrap().id.clone();
        let resumable = ctx.lookup_session(TlsVersion::Tls13, &id).unwrap();

        let second = TlsConnection::new(Arc::clone(&ctx), TlsRole::Client);
        second.set_engine(Box::new(MockEngine::default()));
        second.set_session(resumable).unwrap();
        second.handshake().unwrap();
        assert!(second.is_resumed());

        let stats = ctx.stats();
        assert_eq!(stats.accept_good, 1);
        assert_eq!(stats.connect_good, 1);
        assert_eq!(stats.hits, 1);
    }

    // -------------------------------------------------------
    // 2. One context shared by many handshaking threads
    // -------------------------------------------------------
    #[test]
    fn test_shared_context_across_threads() {
        let ctx = TlsContext::builder()
            .method(ProtocolMethod::Tls)
            .cache_mode(CacheMode::BOTH)
            .session_id_context(b"threads")
            .build()
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = Arc::clone(&ctx);
            handles.push(thread::spawn(move || {
                for _ in 0..4 {
                    let conn = TlsConnection::new(Arc::clone(&ctx), TlsRole::Client);
                    conn.set_engine(Box::new(MockEngine::default()));
                    conn.handshake().unwrap();
                    assert!(conn.is_established());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = ctx.stats();
        assert_eq!(stats.connect_good, 32);
        // Every client handshake cached its fresh session.
        assert_eq!(ctx.session_count(), 32);
    }

    // -------------------------------------------------------
    // 3. Duplication semantics across the lifecycle
    // -------------------------------------------------------
    #[test]
    fn test_duplicate_shares_only_when_established() {
        let ctx = server_ctx();
        let conn = TlsConnection::new(Arc::clone(&ctx), TlsRole::Client);
        conn.set_engine(Box::new(MockEngine::default()));

        let before = conn.duplicate().unwrap();
        assert!(!conn.same_connection(&before));

        conn.handshake().unwrap();
        let after = conn.duplicate().unwrap();
        assert!(conn.same_connection(&after));

        // The pre-handshake copy still runs its own life.
        before.set_engine(Box::new(MockEngine::default()));
        before.handshake().unwrap();
        assert!(!before.same_connection(&conn));
    }

    // -------------------------------------------------------
    // 4. DANE records flow from context table to connection store
    // -------------------------------------------------------
    #[test]
    fn test_dane_record_ordering_end_to_end() {
        let ctx = server_ctx();
        ctx.dane_enable();
        let conn = TlsConnection::new(Arc::clone(&ctx), TlsRole::Client);
        conn.dane_enable("smtp.example.org").unwrap();

        // SHA-256 preferred over SHA-512 by flipping the default ordinals.
        ctx.dane_mtype_set(Some(ferric_types::HashAlgId::Sha256), 1, 2)
            .unwrap();
        ctx.dane_mtype_set(Some(ferric_types::HashAlgId::Sha512), 2, 1)
            .unwrap();

        conn.dane_tlsa_add(3, 1, 2, &[0x11; 64]).unwrap();
        conn.dane_tlsa_add(3, 1, 1, &[0x22; 32]).unwrap();
        conn.dane_tlsa_add(2, 0, 1, &[0x33; 32]).unwrap();

        let store = conn.dane_store().unwrap();
        let order: Vec<(u8, u8)> = store
            .records()
            .iter()
            .map(|r| (r.usage as u8, r.mtype))
            .collect();
        // Usage 3 first; within it the higher ordinal (now SHA-256) leads.
        assert_eq!(order, vec![(3, 1), (3, 2), (2, 1)]);
    }

    // -------------------------------------------------------
    // 5. Client 0-RTT write followed by the real handshake
    // -------------------------------------------------------
    #[test]
    fn test_early_data_then_handshake() {
        let ctx = server_ctx();

        // Seed a resumable session that permits early data.
        let server = TlsConnection::new(Arc::clone(&ctx), TlsRole::Server);
        server.set_engine(Box::new(MockEngine::default()));
        server.set_options(ConnOptions::NO_TICKET);
        server.handshake().unwrap();
        let id = server.session().unwrap().id.clone();
        let session = ctx.lookup_session(TlsVersion::Tls13, &id).unwrap();
        let mut early_session = session.duplicate();
        early_session.max_early_data = 4096;

        let client = TlsConnection::new(Arc::clone(&ctx), TlsRole::Client);
        client.set_engine(Box::new(MockEngine::default()));
        client.set_session(Arc::new(early_session)).unwrap();

        assert_eq!(client.write_early_data(b"GET /").unwrap(), 5);
        client.handshake().unwrap();
        assert!(client.is_resumed());
    }

    // -------------------------------------------------------
    // 6. Server reads early data to completion
    // -------------------------------------------------------
    #[test]
    fn test_server_early_data_to_finish() {
        let ctx = server_ctx();
        let conn = TlsConnection::new(Arc::clone(&ctx), TlsRole::Server);
        let mut eng = MockEngine::default();
        eng.accepted_early = true;
        eng.read.push_back(Ok(3));
        eng.read.push_back(Ok(2));
        conn.set_engine(Box::new(eng));

        let mut buf = [0u8; 64];
        assert_eq!(
            conn.read_early_data(&mut buf).unwrap(),
            EarlyDataRead::Bytes(3)
        );
        assert_eq!(
            conn.read_early_data(&mut buf).unwrap(),
            EarlyDataRead::Bytes(2)
        );
    }

    // -------------------------------------------------------
    // 7. Job pool shared across connections of one context
    // -------------------------------------------------------
    #[test]
    fn test_async_pool_exhaustion_across_connections() {
        let ctx = TlsContext::builder()
            .method(ProtocolMethod::Tls)
            .max_jobs(1)
            .build()
            .unwrap();

        let first = TlsConnection::new(Arc::clone(&ctx), TlsRole::Client);
        let mut eng = MockEngine::default();
        eng.connect.push_back(Err(TlsError::Retry(Retry::WantEvent)));
        first.set_engine(Box::new(eng));
        first.set_async(true);

        let second = TlsConnection::new(Arc::clone(&ctx), TlsRole::Client);
        second.set_engine(Box::new(MockEngine::default()));
        second.set_async(true);

        let err = first.handshake().unwrap_err();
        assert_eq!(err.retry_hint(), Some(Retry::AsyncPaused));

        // The only slot is held by the paused handshake.
        let err = second.handshake().unwrap_err();
        assert_eq!(err.retry_hint(), Some(Retry::AsyncNoJobs));

        first.handshake().unwrap();
        second.handshake().unwrap();
        assert_eq!(ctx.stats().connect_good, 2);
    }

    // -------------------------------------------------------
    // 8. Removal callbacks fire when sessions leave the cache
    // -------------------------------------------------------
    #[test]
    fn test_removal_callback_observes_lifecycle() {
        let removed: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let ctx = TlsContext::builder()
            .method(ProtocolMethod::Tls)
            .cache_mode(CacheMode::BOTH)
            .session_id_context(b"removal")
            .build()
            .unwrap();
        let sink = Arc::clone(&removed);
        ctx.set_remove_session_callback(Arc::new(move |s| {
            sink.lock().unwrap().push(s.id.clone());
        }));

        let conn = TlsConnection::new(Arc::clone(&ctx), TlsRole::Client);
        conn.set_engine(Box::new(MockEngine::default()));
        conn.handshake().unwrap();
        let session = conn.session().unwrap();

        assert!(ctx.remove_session(&session));
        assert!(!session.is_resumable());
        assert_eq!(removed.lock().unwrap().as_slice(), &[session.id.clone()]);
    }
}
