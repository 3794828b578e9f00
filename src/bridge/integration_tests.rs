//! Integration tests for the bridge.
//!
//! The host side runs on tokio over one end of a socket pair; the plugin side
//! runs on a thread over the other end, either as a real [`PluginRuntime`]
//! serving a capability or as a scripted raw peer that misbehaves on purpose.

#[cfg(test)]
mod tests {
    use crate::bridge::frame::{codes, Frame, FrameType, Limits, Method, CHUNK_OVERHEAD};
    use crate::bridge::host_runtime::{BridgeError, CallOptions, CancelHandle, RpcClient};
    use crate::bridge::io::{encode_frame, handshake_accept, to_cbor, FrameReader, FrameWriter, HandshakeRequest, PluginOffer};
    use crate::bridge::plugin_runtime::{PluginError, PluginRuntime};
    use crate::bridge::stream::ByteStream;
    use crate::capability::{
        exporter_methods, importer_methods, storage_methods, CapabilityKind, Concurrency, Exporter,
        ExporterClient, FileInfo, Importer, ImporterClient, Mac, Mode, ScanError, ScanIter, ScanRecord,
        ScanResult, Storage, StorageClient,
    };
    use crate::config::BridgeConfig;
    use std::collections::{BTreeMap, HashMap};
    use std::io::{Cursor, Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            max_chunk: 8,
            window: 2,
            heartbeat_interval_ms: 0,
            handshake_timeout_ms: 5_000,
            ..BridgeConfig::default()
        }
    }

    fn request(kind: CapabilityKind) -> HandshakeRequest {
        HandshakeRequest {
            kind,
            min_version: 1,
            max_version: 1,
            limits: test_config().limits(),
            config: BTreeMap::new(),
        }
    }

    /// Host end as tokio halves, plugin end as a std stream.
    fn socket_pair() -> (tokio::net::UnixStream, UnixStream) {
        let (host, plugin) = UnixStream::pair().unwrap();
        host.set_nonblocking(true).unwrap();
        (tokio::net::UnixStream::from_std(host).unwrap(), plugin)
    }

    async fn serve_runtime(runtime: PluginRuntime, request: HandshakeRequest) -> Result<RpcClient, BridgeError> {
        serve_runtime_with(runtime, request, &test_config()).await
    }

    async fn serve_runtime_with(
        runtime: PluginRuntime,
        request: HandshakeRequest,
        config: &BridgeConfig,
    ) -> Result<RpcClient, BridgeError> {
        let (host, plugin) = socket_pair();
        std::thread::spawn(move || {
            let reader = plugin.try_clone().unwrap();
            runtime.serve(reader, plugin)
        });
        let (reader, writer) = host.into_split();
        RpcClient::attach(reader, writer, request, config).await
    }

    /// Attach to a scripted plugin. The script runs after a normal handshake;
    /// the connection closes when it returns.
    async fn raw_plugin<F>(script: F) -> RpcClient
    where
        F: FnOnce(&mut FrameReader<UnixStream>, &mut FrameWriter<UnixStream>) + Send + 'static,
    {
        let (host, plugin) = socket_pair();
        std::thread::spawn(move || {
            let mut reader = FrameReader::new(plugin.try_clone().unwrap());
            let mut writer = FrameWriter::new(plugin);
            let offer = PluginOffer {
                kind: CapabilityKind::Storage,
                min_version: 1,
                max_version: 1,
                methods: Method::for_capability(CapabilityKind::Storage),
                concurrency: Concurrency::Concurrent,
                name: "raw".to_string(),
                plugin_version: "0.0.0".to_string(),
                limits: Limits::default(),
            };
            handshake_accept(&mut reader, &mut writer, &offer).unwrap();
            script(&mut reader, &mut writer);
        });
        let (reader, writer) = host.into_split();
        RpcClient::attach(reader, writer, request(CapabilityKind::Storage), &test_config())
            .await
            .unwrap()
    }

    /// Next REQ from the host, skipping ACK and other bookkeeping frames.
    fn next_req(reader: &mut FrameReader<UnixStream>) -> Option<Frame> {
        loop {
            match reader.read() {
                Ok(Some(frame)) if frame.frame_type == FrameType::Req => return Some(frame),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }

    fn wait_for_cancel(reader: &mut FrameReader<UnixStream>, id: u64) {
        while let Ok(Some(frame)) = reader.read() {
            if frame.frame_type == FrameType::Cancel && frame.id == id {
                return;
            }
        }
        panic!("connection closed before CANCEL for call {}", id);
    }

    fn hold_open(reader: &mut FrameReader<UnixStream>) {
        while let Ok(Some(_)) = reader.read() {}
    }

    fn mac(n: u8) -> Mac {
        Mac([n; 32])
    }

    async fn drain(mut stream: ByteStream) -> Result<(Vec<u8>, bool), BridgeError> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok((out, stream.is_short_read()))
    }

    // -------------------------------------------------------------------------
    // Reference capabilities
    // -------------------------------------------------------------------------

    #[derive(Default)]
    struct MemStorage {
        config: Mutex<Vec<u8>>,
        objects: Mutex<HashMap<(&'static str, Mac), Vec<u8>>>,
    }

    impl MemStorage {
        fn put(&self, ns: &'static str, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError> {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            let n = data.len() as u64;
            self.objects.lock().unwrap().insert((ns, mac), data);
            Ok(n)
        }

        fn get(&self, ns: &'static str, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError> {
            match self.objects.lock().unwrap().get(&(ns, mac)) {
                Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
                None => Err(PluginError::not_found(format!("{} {}", ns, mac))),
            }
        }

        fn list(&self, ns: &'static str) -> Vec<Mac> {
            let mut macs: Vec<Mac> = self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|(kind, _)| *kind == ns)
                .map(|(_, mac)| *mac)
                .collect();
            macs.sort();
            macs
        }

        fn delete(&self, ns: &'static str, mac: Mac) -> Result<(), PluginError> {
            self.objects.lock().unwrap().remove(&(ns, mac));
            Ok(())
        }
    }

    impl Storage for MemStorage {
        fn create(&self, config: &[u8]) -> Result<(), PluginError> {
            *self.config.lock().unwrap() = config.to_vec();
            Ok(())
        }
        fn open(&self) -> Result<Vec<u8>, PluginError> {
            Ok(self.config.lock().unwrap().clone())
        }
        fn location(&self) -> Result<String, PluginError> {
            Ok("mem://".to_string())
        }
        fn mode(&self) -> Result<Mode, PluginError> {
            Ok(Mode::READ_WRITE)
        }
        fn size(&self) -> Result<i64, PluginError> {
            Ok(self.objects.lock().unwrap().values().map(|v| v.len() as i64).sum())
        }
        fn get_states(&self) -> Result<Vec<Mac>, PluginError> {
            Ok(self.list("state"))
        }
        fn put_state(&self, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError> {
            self.put("state", mac, reader)
        }
        fn get_state(&self, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError> {
            self.get("state", mac)
        }
        fn delete_state(&self, mac: Mac) -> Result<(), PluginError> {
            self.delete("state", mac)
        }
        fn get_packfiles(&self) -> Result<Vec<Mac>, PluginError> {
            Ok(self.list("packfile"))
        }
        fn put_packfile(&self, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError> {
            self.put("packfile", mac, reader)
        }
        fn get_packfile(&self, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError> {
            self.get("packfile", mac)
        }
        fn get_packfile_blob(&self, mac: Mac, offset: u64, _length: u64) -> Result<Box<dyn Read + Send>, PluginError> {
            let objects = self.objects.lock().unwrap();
            let data = objects
                .get(&("packfile", mac))
                .ok_or_else(|| PluginError::not_found(mac.to_hex()))?;
            let start = (offset as usize).min(data.len());
            Ok(Box::new(Cursor::new(data[start..].to_vec())))
        }
        fn delete_packfile(&self, mac: Mac) -> Result<(), PluginError> {
            self.delete("packfile", mac)
        }
        fn get_locks(&self) -> Result<Vec<Mac>, PluginError> {
            Ok(self.list("lock"))
        }
        fn put_lock(&self, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError> {
            self.put("lock", mac, reader)
        }
        fn get_lock(&self, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError> {
            self.get("lock", mac)
        }
        fn delete_lock(&self, mac: Mac) -> Result<(), PluginError> {
            self.delete("lock", mac)
        }
        fn close(&self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    async fn storage_client() -> StorageClient {
        storage_client_with(test_config()).await
    }

    async fn storage_client_with(config: BridgeConfig) -> StorageClient {
        let runtime = PluginRuntime::new(CapabilityKind::Storage, "mem", "0.1.0")
            .with_factory(|_config| Ok(storage_methods(Arc::new(MemStorage::default()))));
        let request = HandshakeRequest {
            limits: config.limits(),
            ..request(CapabilityKind::Storage)
        };
        StorageClient::new(serve_runtime_with(runtime, request, &config).await.unwrap())
    }

    fn record(pathname: &str) -> ScanResult {
        ScanResult::Record(ScanRecord {
            pathname: pathname.to_string(),
            file_info: FileInfo::regular(pathname.rsplit('/').next().unwrap_or_default(), 4, 0o644),
            target: None,
            is_xattr: false,
            xattr_name: None,
        })
    }

    /// Endless scan that reports when it is dropped.
    struct Endless {
        produced: u64,
        released: Arc<AtomicBool>,
    }

    impl Iterator for Endless {
        type Item = Result<ScanResult, PluginError>;

        fn next(&mut self) -> Option<Self::Item> {
            self.produced += 1;
            Some(Ok(record(&format!("/data/{}", self.produced))))
        }
    }

    impl Drop for Endless {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Copy)]
    enum ScanPlan {
        /// Three entries, the middle one a per-entry error
        Listed,
        Endless,
        /// Two entries, then the source disappears
        FailsMidway,
    }

    struct TestImporter {
        plan: ScanPlan,
        released: Arc<AtomicBool>,
    }

    impl Importer for TestImporter {
        fn origin(&self) -> Result<String, PluginError> {
            Ok("testhost".to_string())
        }
        fn kind(&self) -> Result<String, PluginError> {
            Ok("mem".to_string())
        }
        fn root(&self) -> Result<String, PluginError> {
            Ok("/".to_string())
        }
        fn scan(&self) -> Result<ScanIter, PluginError> {
            let entries = match self.plan {
                ScanPlan::Endless => {
                    return Ok(Box::new(Endless {
                        produced: 0,
                        released: self.released.clone(),
                    }))
                }
                ScanPlan::Listed => vec![
                    Ok(record("/etc")),
                    Ok(ScanResult::Error(ScanError {
                        pathname: "/etc/shadow".to_string(),
                        message: "permission denied".to_string(),
                    })),
                    Ok(record("/etc/hosts")),
                ],
                ScanPlan::FailsMidway => vec![
                    Ok(record("/mnt")),
                    Ok(record("/mnt/a")),
                    Err(PluginError::handler("disk vanished")),
                    Ok(record("/mnt/never")),
                ],
            };
            Ok(Box::new(entries.into_iter()))
        }
        fn open_reader(&self, pathname: &str) -> Result<Box<dyn Read + Send>, PluginError> {
            match pathname {
                "/etc/hosts" => Ok(Box::new(Cursor::new(b"127.0.0.1 localhost\n".to_vec()))),
                other => Err(PluginError::not_found(other)),
            }
        }
        fn close(&self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    async fn importer_client(plan: ScanPlan, released: Arc<AtomicBool>) -> ImporterClient {
        let importer = Arc::new(TestImporter { plan, released });
        let mut runtime = PluginRuntime::new(CapabilityKind::Importer, "imp", "0.1.0");
        runtime.register_table(importer_methods(importer));
        ImporterClient::new(serve_runtime(runtime, request(CapabilityKind::Importer)).await.unwrap())
    }

    #[derive(Default)]
    struct RecordingExporter {
        files: Mutex<HashMap<String, Vec<u8>>>,
        events: Mutex<Vec<String>>,
    }

    impl Exporter for RecordingExporter {
        fn root(&self) -> Result<String, PluginError> {
            Ok("/restore".to_string())
        }
        fn create_directory(&self, pathname: &str) -> Result<(), PluginError> {
            self.events.lock().unwrap().push(format!("mkdir {}", pathname));
            Ok(())
        }
        fn store_file(&self, pathname: &str, reader: &mut dyn Read, _size: u64) -> Result<(), PluginError> {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            self.files.lock().unwrap().insert(pathname.to_string(), data);
            Ok(())
        }
        fn set_permissions(&self, pathname: &str, info: &FileInfo) -> Result<(), PluginError> {
            self.events.lock().unwrap().push(format!("chmod {} {:o}", pathname, info.mode));
            Ok(())
        }
        fn close(&self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Storage over the bridge
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_storage_put_get_roundtrip() {
        let storage = storage_client().await;
        // Larger than max_chunk and window together, so both directions wait on ACKs.
        let body: Vec<u8> = (0..100u8).collect();

        let written = storage.put_state(mac(1), &body[..], Some(body.len() as u64)).await.unwrap();
        assert_eq!(written, 100);

        let stream = storage.get_state(mac(1)).await.unwrap();
        assert_eq!(stream.read_to_end().await.unwrap(), body);
        assert_eq!(storage.get_states().await.unwrap(), vec![mac(1)]);
    }

    #[tokio::test]
    async fn test_chunk_limit_equal_to_frame_limit() {
        let config = BridgeConfig {
            max_frame: 1000,
            max_chunk: 1000,
            ..test_config()
        };
        let storage = storage_client_with(config).await;
        assert_eq!(storage.rpc().limits().max_frame, 1000);
        assert_eq!(storage.rpc().limits().max_chunk, 1000 - CHUNK_OVERHEAD);

        let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let written = storage.put_packfile(mac(6), &body[..], Some(5000)).await.unwrap();
        assert_eq!(written, 5000);
        let back = storage.get_packfile(mac(6)).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(back, body);
    }

    #[tokio::test]
    async fn test_storage_put_is_idempotent_and_delete_missing_succeeds() {
        let storage = storage_client().await;
        for _ in 0..2 {
            storage.put_lock(mac(3), &b"lock"[..], Some(4)).await.unwrap();
        }
        assert_eq!(storage.get_locks().await.unwrap(), vec![mac(3)]);

        storage.delete_lock(mac(3)).await.unwrap();
        storage.delete_lock(mac(3)).await.unwrap();
        storage.delete_packfile(mac(42)).await.unwrap();
        assert!(storage.get_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_get_missing_is_not_found() {
        let storage = storage_client().await;
        let err = storage.get_packfile(mac(9)).await.unwrap_err();
        assert!(err.is_not_found(), "got {:?}", err);
        // The connection survives a per-call error.
        assert_eq!(storage.location().await.unwrap(), "mem://");
    }

    #[tokio::test]
    async fn test_storage_config_blob_and_metadata() {
        let storage = storage_client().await;
        storage.create(b"\x00opaque\xff").await.unwrap();
        assert_eq!(storage.open().await.unwrap(), b"\x00opaque\xff");
        assert_eq!(storage.mode().await.unwrap(), Mode::READ_WRITE);

        storage.put_packfile(mac(2), &b"0123456789"[..], None).await.unwrap();
        assert_eq!(storage.size().await.unwrap(), 10);
        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_declared_size_mismatch() {
        let storage = storage_client().await;
        let err = storage.put_state(mac(4), &b"abc"[..], Some(5)).await.unwrap_err();
        assert_eq!(err, BridgeError::SizeMismatch { declared: 5, actual: 3 });
        assert!(storage.get_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_packfile_blob_range_and_short_read() {
        let storage = storage_client().await;
        storage.put_packfile(mac(5), &b"0123456789"[..], Some(10)).await.unwrap();

        let (bytes, short) = drain(storage.get_packfile_blob(mac(5), 2, 4).await.unwrap()).await.unwrap();
        assert_eq!(bytes, b"2345");
        assert!(!short);

        let (bytes, short) = drain(storage.get_packfile_blob(mac(5), 8, 10).await.unwrap()).await.unwrap();
        assert_eq!(bytes, b"89");
        assert!(short);

        let (bytes, short) = drain(storage.get_packfile_blob(mac(5), 20, 3).await.unwrap()).await.unwrap();
        assert!(bytes.is_empty());
        assert!(short);

        // A range larger than max_chunk spans several chunks.
        let (bytes, _) = drain(storage.get_packfile_blob(mac(5), 0, 10).await.unwrap()).await.unwrap();
        assert_eq!(bytes, b"0123456789");
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_connection() {
        let storage = storage_client().await;
        let uploads = (0..8u8).map(|n| {
            let storage = storage.clone();
            async move {
                let body = vec![n; 20 + n as usize];
                storage.put_state(mac(n), &body[..], Some(body.len() as u64)).await
            }
        });
        for result in spawn_all(uploads).await {
            result.unwrap();
        }
        assert_eq!(storage.get_states().await.unwrap().len(), 8);
        for n in 0..8u8 {
            let body = storage.get_state(mac(n)).await.unwrap().read_to_end().await.unwrap();
            assert_eq!(body, vec![n; 20 + n as usize]);
        }
    }

    async fn spawn_all<F: std::future::Future + Send + 'static>(futures: impl Iterator<Item = F>) -> Vec<F::Output>
    where
        F::Output: Send + 'static,
    {
        let handles: Vec<_> = futures.map(tokio::spawn).collect();
        let mut out = Vec::new();
        for handle in handles {
            out.push(handle.await.unwrap());
        }
        out
    }

    // -------------------------------------------------------------------------
    // Importer and exporter over the bridge
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_scan_preserves_order_and_per_entry_errors() {
        let importer = importer_client(ScanPlan::Listed, Arc::new(AtomicBool::new(false))).await;
        assert_eq!(importer.origin().await.unwrap(), "testhost");
        assert_eq!(importer.kind().await.unwrap(), "mem");

        let results = importer.scan().await.unwrap().collect().await.unwrap();
        let paths: Vec<&str> = results.iter().map(|r| r.pathname()).collect();
        assert_eq!(paths, vec!["/etc", "/etc/shadow", "/etc/hosts"]);
        assert!(matches!(results[1], ScanResult::Error(_)));

        let hosts = importer.open_reader("/etc/hosts").await.unwrap().read_to_end().await.unwrap();
        assert_eq!(hosts, b"127.0.0.1 localhost\n");
        assert!(importer.open_reader("/nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_scan_error_after_results_ends_stream() {
        let importer = importer_client(ScanPlan::FailsMidway, Arc::new(AtomicBool::new(false))).await;

        let mut scan = importer.scan().await.unwrap();
        assert_eq!(scan.next().await.unwrap().unwrap().pathname(), "/mnt");
        assert_eq!(scan.next().await.unwrap().unwrap().pathname(), "/mnt/a");
        match scan.next().await {
            Err(BridgeError::Capability { code, message }) => {
                assert_eq!(code, codes::HANDLER_ERROR);
                assert_eq!(message, "disk vanished");
            }
            other => panic!("expected the scan to fail, got {:?}", other),
        }
        drop(scan);

        // The failure is scoped to the scan.
        assert_eq!(importer.origin().await.unwrap(), "testhost");
        let results = importer.scan().await.unwrap().collect().await;
        assert!(matches!(results, Err(BridgeError::Capability { .. })));
    }

    #[tokio::test]
    async fn test_abandoned_scan_releases_plugin_iterator() {
        let released = Arc::new(AtomicBool::new(false));
        let importer = importer_client(ScanPlan::Endless, released.clone()).await;

        let mut scan = importer.scan().await.unwrap();
        for _ in 0..5 {
            assert!(scan.next().await.unwrap().is_some());
        }
        drop(scan);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !released.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("plugin kept scanning after the host dropped the stream");

        // The importer still answers.
        assert_eq!(importer.root().await.unwrap(), "/");
    }

    #[tokio::test]
    async fn test_exporter_store_and_permissions() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut runtime = PluginRuntime::new(CapabilityKind::Exporter, "exp", "0.1.0")
            .with_concurrency(Concurrency::Serialized);
        runtime.register_table(exporter_methods(exporter.clone()));
        let client = ExporterClient::new(serve_runtime(runtime, request(CapabilityKind::Exporter)).await.unwrap());

        assert_eq!(client.root().await.unwrap(), "/restore");
        client.create_directory("/restore/etc").await.unwrap();
        client.store_file("/restore/etc/motd", &b"welcome home"[..], 12).await.unwrap();
        client
            .set_permissions("/restore/etc/motd", &FileInfo::regular("motd", 12, 0o600))
            .await
            .unwrap();

        let err = client.store_file("/restore/etc/bad", &b"abc"[..], 7).await.unwrap_err();
        assert_eq!(err, BridgeError::SizeMismatch { declared: 7, actual: 3 });

        let cancel = CancelHandle::new();
        let cancelled = client.clone().with_options(CallOptions::default().with_cancel(cancel.clone()));
        cancel.cancel();
        assert_eq!(cancelled.root().await.unwrap_err(), BridgeError::Cancelled);
        assert_eq!(client.root().await.unwrap(), "/restore");
        client.close().await.unwrap();

        assert_eq!(exporter.files.lock().unwrap().get("/restore/etc/motd").unwrap(), b"welcome home");
        assert!(!exporter.files.lock().unwrap().contains_key("/restore/etc/bad"));
        assert_eq!(
            *exporter.events.lock().unwrap(),
            vec!["mkdir /restore/etc".to_string(), "chmod /restore/etc/motd 600".to_string()]
        );
    }

    #[tokio::test]
    async fn test_handshake_rejects_disjoint_versions() {
        let runtime = PluginRuntime::new(CapabilityKind::Storage, "old", "0.1.0").with_versions(1, 1);
        let mut req = request(CapabilityKind::Storage);
        req.min_version = 2;
        req.max_version = 3;
        let err = serve_runtime(runtime, req).await.unwrap_err();
        assert!(matches!(err, BridgeError::Handshake(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_capability() {
        let runtime = PluginRuntime::new(CapabilityKind::Importer, "imp", "0.1.0");
        let err = serve_runtime(runtime, request(CapabilityKind::Storage)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Handshake(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_method_outside_descriptor_fails_locally() {
        let mut runtime = PluginRuntime::new(CapabilityKind::Storage, "partial", "0.1.0");
        runtime.register_raw(Method::Location, |_req, res| res.reply_cbor("partial://"));
        let client = StorageClient::new(serve_runtime(runtime, request(CapabilityKind::Storage)).await.unwrap());

        assert_eq!(client.location().await.unwrap(), "partial://");
        match client.size().await.unwrap_err() {
            BridgeError::Capability { code, .. } => assert_eq!(code, codes::NO_HANDLER),
            other => panic!("expected NO_HANDLER, got {:?}", other),
        }
    }

    // -------------------------------------------------------------------------
    // Misbehaving peers
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_interleaved_streams_are_demultiplexed() {
        let client = raw_plugin(|reader, writer| {
            let a = next_req(reader).unwrap();
            let b = next_req(reader).unwrap();
            writer.write(&Frame::chunk(a.id, 0, b"a0".to_vec())).unwrap();
            writer.write(&Frame::chunk(b.id, 0, b"b0".to_vec())).unwrap();
            writer.write(&Frame::chunk(a.id, 1, b"a1".to_vec())).unwrap();
            writer.write(&Frame::end(b.id, 2, false)).unwrap();
            writer.write(&Frame::end(a.id, 4, false)).unwrap();
            hold_open(reader);
        })
        .await;
        let storage = StorageClient::new(client);

        let (a, b) = tokio::join!(
            async { storage.get_state(mac(1)).await?.read_to_end().await },
            async {
                // Let the first REQ go out first.
                tokio::time::sleep(Duration::from_millis(20)).await;
                storage.get_state(mac(2)).await?.read_to_end().await
            },
        );
        assert_eq!(a.unwrap(), b"a0a1");
        assert_eq!(b.unwrap(), b"b0");
    }

    #[tokio::test]
    async fn test_peer_lost_fails_outstanding_call() {
        let client = raw_plugin(|reader, _writer| {
            let _ = next_req(reader);
        })
        .await;
        let storage = StorageClient::new(client.clone());

        let err = tokio::time::timeout(Duration::from_secs(5), storage.size())
            .await
            .expect("call never resolved")
            .unwrap_err();
        assert_eq!(err, BridgeError::PeerLost);

        tokio::time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
        assert!(!client.is_alive());
        assert_eq!(storage.size().await.unwrap_err(), BridgeError::PeerLost);
    }

    #[tokio::test]
    async fn test_stream_without_end_is_truncated() {
        let client = raw_plugin(|reader, writer| {
            let req = next_req(reader).unwrap();
            writer.write(&Frame::chunk(req.id, 0, b"part".to_vec())).unwrap();
        })
        .await;
        let storage = StorageClient::new(client);

        let mut stream = storage.get_packfile(mac(1)).await.unwrap();
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"part");
        assert_eq!(stream.next_chunk().await.unwrap_err(), BridgeError::TruncatedStream);
    }

    #[tokio::test]
    async fn test_end_total_disagreeing_with_bytes_is_size_mismatch() {
        let client = raw_plugin(|reader, writer| {
            let req = next_req(reader).unwrap();
            writer.write(&Frame::chunk(req.id, 0, b"abc".to_vec())).unwrap();
            writer.write(&Frame::end(req.id, 5, false)).unwrap();
            hold_open(reader);
        })
        .await;
        let storage = StorageClient::new(client);

        let err = storage.get_state(mac(1)).await.unwrap().read_to_end().await.unwrap_err();
        assert_eq!(err, BridgeError::SizeMismatch { declared: 5, actual: 3 });
    }

    #[tokio::test]
    async fn test_cancelled_stream_absorbs_late_frames() {
        let client = raw_plugin(|reader, writer| {
            let stream = next_req(reader).unwrap();
            writer.write(&Frame::chunk(stream.id, 0, b"ab".to_vec())).unwrap();
            wait_for_cancel(reader, stream.id);
            writer.write(&Frame::chunk(stream.id, 1, b"cd".to_vec())).unwrap();
            writer.write(&Frame::err(stream.id, codes::CANCELLED, "stopped")).unwrap();

            let next = next_req(reader).unwrap();
            writer.write(&Frame::res(next.id, to_cbor("raw://").unwrap())).unwrap();
            hold_open(reader);
        })
        .await;
        let storage = StorageClient::new(client.clone());

        let mut stream = storage.get_state(mac(1)).await.unwrap();
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"ab");
        stream.cancel();

        assert_eq!(storage.location().await.unwrap(), "raw://");
        assert_eq!(client.in_flight(), 0);
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn test_deadline_resolves_to_cancelled() {
        let client = raw_plugin(|reader, _writer| {
            let req = next_req(reader).unwrap();
            wait_for_cancel(reader, req.id);
            hold_open(reader);
        })
        .await;

        let opts = CallOptions::default().with_deadline(Duration::from_millis(100));
        let err = client.call_with(Method::Size, Vec::new(), opts).await.unwrap_err();
        assert_eq!(err, BridgeError::Cancelled);
    }

    #[tokio::test]
    async fn test_client_options_apply_to_every_call() {
        let client = raw_plugin(|reader, writer| {
            let unary = next_req(reader).unwrap();
            wait_for_cancel(reader, unary.id);
            let download = next_req(reader).unwrap();
            wait_for_cancel(reader, download.id);

            let next = next_req(reader).unwrap();
            writer.write(&Frame::res(next.id, to_cbor("raw://").unwrap())).unwrap();
            hold_open(reader);
        })
        .await;
        let storage = StorageClient::new(client.clone())
            .with_options(CallOptions::default().with_deadline(Duration::from_millis(100)));

        let err = tokio::time::timeout(Duration::from_secs(5), storage.size())
            .await
            .expect("deadline not applied")
            .unwrap_err();
        assert_eq!(err, BridgeError::Cancelled);
        let err = tokio::time::timeout(Duration::from_secs(5), storage.get_state(mac(1)))
            .await
            .expect("deadline not applied to stream")
            .unwrap_err();
        assert_eq!(err, BridgeError::Cancelled);

        assert_eq!(StorageClient::new(client).location().await.unwrap(), "raw://");
    }

    #[tokio::test]
    async fn test_stalled_upload_source_honours_deadline() {
        let client = raw_plugin(|reader, writer| {
            let upload = next_req(reader).unwrap();
            wait_for_cancel(reader, upload.id);

            let next = next_req(reader).unwrap();
            writer.write(&Frame::res(next.id, to_cbor("raw://").unwrap())).unwrap();
            hold_open(reader);
        })
        .await;
        let storage = StorageClient::new(client.clone())
            .with_options(CallOptions::default().with_deadline(Duration::from_millis(100)));

        // The other end stays open and silent, so reads never complete
        let (source, _silent) = tokio::io::duplex(64);
        let err = tokio::time::timeout(Duration::from_secs(5), storage.put_state(mac(1), source, None))
            .await
            .expect("stalled source blocked the deadline")
            .unwrap_err();
        assert_eq!(err, BridgeError::Cancelled);

        assert_eq!(StorageClient::new(client).location().await.unwrap(), "raw://");
    }

    #[tokio::test]
    async fn test_malformed_frame_fails_only_its_call() {
        let client = raw_plugin(|reader, writer| {
            let bad = next_req(reader).unwrap();
            let mut corrupt = Frame::chunk(bad.id, 0, b"xyz".to_vec());
            corrupt.checksum = Some(0);
            let bytes = encode_frame(&corrupt).unwrap();
            let stream = writer.inner_mut();
            stream.write_all(&(bytes.len() as u32).to_be_bytes()).unwrap();
            stream.write_all(&bytes).unwrap();

            let good = next_req(reader).unwrap();
            writer.write(&Frame::res(good.id, to_cbor(&7i64).unwrap())).unwrap();
            hold_open(reader);
        })
        .await;
        let storage = StorageClient::new(client.clone());

        let err = storage.get_state(mac(1)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)), "got {:?}", err);
        assert_eq!(storage.size().await.unwrap(), 7);
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn test_frame_for_unknown_call_is_dropped() {
        let client = raw_plugin(|reader, writer| {
            let req = next_req(reader).unwrap();
            writer.write(&Frame::res(req.id + 1000, to_cbor("stray").unwrap())).unwrap();
            writer.write(&Frame::log(req.id, "info", "answering")).unwrap();
            writer.write(&Frame::res(req.id, to_cbor("raw://").unwrap())).unwrap();
            hold_open(reader);
        })
        .await;
        let storage = StorageClient::new(client);
        assert_eq!(storage.location().await.unwrap(), "raw://");
    }
}
