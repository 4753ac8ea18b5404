//! Reconfiguration controller.
//!
//! A single loop owns every piece of mutable state: the debouncer, the
//! rebuild retry deadline and the reload-only deadline armed by file
//! changes.  Stream signals and file events arrive over channels and are
//! handled one at a time; a rebuild runs to completion before the next
//! message is taken, so stream handling is delayed by a slow rebuild but
//! never interleaved with it.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::config::Config;
use crate::debounce::{DebounceState, Observed};
use crate::discovery::{self, TopologyFilter};
use crate::emitter::{install_fallback, ConfigEmitter};
use crate::platform::PlatformApi;
use crate::stream::StreamSignal;

pub struct Controller {
    api: Arc<dyn PlatformApi>,
    emitter: ConfigEmitter,
    filter: TopologyFilter,
    conf_path: PathBuf,
    fallback_conf_path: Option<PathBuf>,
    debounce: DebounceState,
    retry_delay: Duration,
    file_quiet: Duration,
    retry_at: Option<Instant>,
    reload_at: Option<Instant>,
}

impl Controller {
    pub fn new(config: &Config, api: Arc<dyn PlatformApi>, emitter: ConfigEmitter) -> Self {
        Self {
            api,
            emitter,
            filter: TopologyFilter {
                mode: config.restrict_mode,
                node: config.node_fqdn.clone(),
            },
            conf_path: config.conf_path.clone(),
            fallback_conf_path: config.fallback_conf_path.clone(),
            debounce: DebounceState::new(config.quiet_period()),
            retry_delay: config.retry_delay(),
            file_quiet: config.file_quiet_period(),
            retry_at: None,
            reload_at: None,
        }
    }

    /// Initial unconditional rebuild, emit and reload.
    pub async fn startup(&mut self) {
        info!("Init proxy config");
        info!("Restriction mode: {}", self.filter.mode);
        if self.reconfigure().await {
            return;
        }

        if let Some(fallback) = &self.fallback_conf_path {
            match install_fallback(fallback, &self.conf_path) {
                Ok(true) => {
                    info!("Installed fallback config from {}", fallback.display());
                    if let Err(e) = self.emitter.reload() {
                        error!("{}", e);
                    }
                }
                Ok(false) => {}
                Err(e) => error!("Failed to install fallback config: {}", e),
            }
        }
    }

    /// Rebuild the discovery model and emit it.  On a query failure the
    /// previous configuration stays and a single retry is scheduled.
    pub async fn reconfigure(&mut self) -> bool {
        let services = match discovery::rebuild(self.api.as_ref(), &self.filter).await {
            Ok(services) => services,
            Err(e) => {
                error!("Failed to query platform: {}", e);
                if self.retry_at.is_none() {
                    info!("Retrying in {:?}", self.retry_delay);
                    self.retry_at = Some(Instant::now() + self.retry_delay);
                }
                return false;
            }
        };
        self.retry_at = None;

        match self.emitter.emit(&services, &self.conf_path) {
            Ok(()) => true,
            Err(e) => {
                error!("Keeping previous proxy config: {}", e);
                false
            }
        }
    }

    pub async fn handle_stream(&mut self, signal: StreamSignal) {
        match signal {
            StreamSignal::Connected => {
                let pending = self.debounce.in_transition();
                if self.debounce.on_connect() {
                    warn!(
                        "Reconnected while {} service transitions were pending - rewriting config now",
                        pending
                    );
                    self.reconfigure().await;
                }
            }
            StreamSignal::Service { uuid, state } => {
                match self.debounce.observe(&uuid, state, Instant::now()) {
                    Observed::Settled => debug!(
                        "Waiting for {} more service transitions",
                        self.debounce.in_transition()
                    ),
                    Observed::Ignored => debug!("Ignoring {} state of service {}", state, uuid),
                    Observed::Transition | Observed::Armed => {}
                }
            }
        }
    }

    /// The rendered file changed on disk; reload once it has been quiet.
    pub fn file_changed(&mut self) {
        self.reload_at = Some(Instant::now() + self.file_quiet);
    }

    /// Process events until `shutdown` resolves with the signal name.
    pub async fn run<S>(
        mut self,
        mut stream_rx: mpsc::Receiver<StreamSignal>,
        mut file_rx: mpsc::UnboundedReceiver<()>,
        shutdown: S,
    ) where
        S: Future<Output = &'static str>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                signal = &mut shutdown => {
                    info!("Signal {} received. Shutting down.", signal);
                    break;
                }
                Some(signal) = stream_rx.recv() => self.handle_stream(signal).await,
                Some(()) = file_rx.recv() => self.file_changed(),
                _ = sleep_until_opt(self.debounce.deadline()) => {
                    if self.debounce.take_due(Instant::now()) {
                        self.reconfigure().await;
                    }
                }
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.reconfigure().await;
                }
                _ = sleep_until_opt(self.reload_at) => {
                    self.reload_at = None;
                    if let Err(e) = self.emitter.reload() {
                        error!("{}", e);
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolves with the name of the first SIGINT or SIGTERM received.
pub async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                name = ctrl_c() => name,
                _ = term.recv() => "TERM",
            },
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                ctrl_c().await
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "INT",
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::tests::FakePlatform;
    use crate::render::NginxRenderer;
    use crate::types::LifecycleState::{self, *};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;

    struct Harness {
        platform: Arc<FakePlatform>,
        stream_tx: mpsc::Sender<StreamSignal>,
        file_tx: mpsc::UnboundedSender<()>,
        stop: oneshot::Sender<()>,
        handle: JoinHandle<()>,
        tmp: TempDir,
    }

    impl Harness {
        fn conf_path(&self) -> PathBuf {
            self.tmp.path().join("default.conf")
        }

        fn rebuilds(&self) -> usize {
            self.platform.list_calls.load(Ordering::SeqCst)
        }

        async fn service(&self, uuid: &str, state: LifecycleState) {
            self.stream_tx
                .send(StreamSignal::Service {
                    uuid: uuid.into(),
                    state,
                })
                .await
                .unwrap();
        }

        async fn finish(self) {
            let _ = self.stop.send(());
            self.handle.await.unwrap();
        }
    }

    fn fleet() -> FakePlatform {
        let platform = FakePlatform::default();
        platform.add_service("web", "Running", &["http"], &["c1"]);
        platform.add_container("c1", "10.0.0.1", "Running", &[("VIRTUAL_HOST", "web.example.com")]);
        platform
    }

    fn controller(platform: Arc<FakePlatform>, tmp: &TempDir, reload: Vec<String>) -> Controller {
        let config = Config {
            conf_path: tmp.path().join("default.conf"),
            ..Config::default()
        };
        let emitter = ConfigEmitter::new(Box::new(NginxRenderer), reload);
        Controller::new(&config, platform, emitter)
    }

    fn start(controller: Controller, platform: Arc<FakePlatform>, tmp: TempDir) -> Harness {
        let (stream_tx, stream_rx) = mpsc::channel(16);
        let (file_tx, file_rx) = mpsc::unbounded_channel();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(controller.run(stream_rx, file_rx, async move {
            let _ = stopped.await;
            "TEST"
        }));
        Harness {
            platform,
            stream_tx,
            file_tx,
            stop,
            handle,
            tmp,
        }
    }

    fn harness(platform: FakePlatform) -> Harness {
        let platform = Arc::new(platform);
        let tmp = TempDir::new().unwrap();
        let controller = controller(Arc::clone(&platform), &tmp, vec!["true".into()]);
        start(controller, platform, tmp)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_reconfigures_once_after_quiet_period() {
        let h = harness(fleet());

        h.service("A", Starting).await;
        h.service("B", Starting).await;
        h.service("A", Running).await;
        h.service("B", Running).await;

        sleep(Duration::from_secs(4)).await;
        assert_eq!(h.rebuilds(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(h.rebuilds(), 1);
        let written = std::fs::read_to_string(h.conf_path()).unwrap();
        assert!(written.contains("server 10.0.0.1:80;"));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.rebuilds(), 1);
        h.finish().await;
    }

    #[tokio::test]
    async fn one_misconfigured_service_does_not_block_the_rest() {
        let platform = fleet();
        platform.add_service("blog", "Running", &["http"], &["c2"]);
        platform.add_container(
            "c2",
            "10.0.0.2",
            "Running",
            &[("VIRTUAL_HOST", "blog.example.com"), ("VIRTUAL_PORT", "web")],
        );
        let platform = Arc::new(platform);
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(Arc::clone(&platform), &tmp, vec!["true".into()]);

        assert!(controller.reconfigure().await);

        let written = std::fs::read_to_string(tmp.path().join("default.conf")).unwrap();
        assert!(written.contains("server_name web.example.com;"));
        assert!(written.contains("server 10.0.0.1:80;"));
        assert!(!written.contains("blog.example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_reconfiguration_while_transitions_are_open() {
        let h = harness(fleet());

        h.service("A", Scaling).await;
        h.service("B", Redeploying).await;
        h.service("A", Running).await;

        sleep(Duration::from_secs(600)).await;
        assert_eq!(h.rebuilds(), 0);
        h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_transition_during_quiet_period_postpones_rebuild() {
        let h = harness(fleet());

        h.service("A", Scaling).await;
        h.service("A", Running).await;
        sleep(Duration::from_secs(3)).await;
        h.service("B", Stopping).await;
        sleep(Duration::from_secs(3)).await;
        assert_eq!(h.rebuilds(), 0);

        h.service("B", Stopped).await;
        sleep(Duration::from_secs(6)).await;
        assert_eq!(h.rebuilds(), 1);
        h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_mid_transition_reconfigures_immediately_once() {
        let h = harness(fleet());

        h.service("A", Scaling).await;
        h.stream_tx.send(StreamSignal::Connected).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(h.rebuilds(), 1);

        // A late settle for the forgotten transition does nothing.
        h.service("A", Running).await;
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.rebuilds(), 1);
        h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_while_idle_does_nothing() {
        let h = harness(fleet());
        h.stream_tx.send(StreamSignal::Connected).await.unwrap();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.rebuilds(), 0);
        h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rebuild_is_retried_after_backoff() {
        let platform = Arc::new(fleet());
        platform.fail.store(true, Ordering::SeqCst);
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(Arc::clone(&platform), &tmp, vec!["true".into()]);

        controller.startup().await;
        assert_eq!(platform.list_calls.load(Ordering::SeqCst), 1);
        assert!(!tmp.path().join("default.conf").exists());

        platform.fail.store(false, Ordering::SeqCst);
        let h = start(controller, platform, tmp);
        sleep(Duration::from_secs(9)).await;
        assert_eq!(h.rebuilds(), 1);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(h.rebuilds(), 2);
        assert!(h.conf_path().exists());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.rebuilds(), 2);
        h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_keep_one_retry_pending() {
        let platform = Arc::new(fleet());
        platform.fail.store(true, Ordering::SeqCst);
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(Arc::clone(&platform), &tmp, vec!["true".into()]);
        controller.startup().await;

        let h = start(controller, platform, tmp);
        // An event-driven rebuild also fails; it must not stack another retry.
        h.service("A", Scaling).await;
        h.service("A", Running).await;
        sleep(Duration::from_secs(6)).await;
        assert_eq!(h.rebuilds(), 2);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.rebuilds(), 3);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.rebuilds(), 4);
        h.finish().await;
    }

    #[tokio::test]
    async fn startup_installs_fallback_when_platform_is_down() {
        let platform = Arc::new(fleet());
        platform.fail.store(true, Ordering::SeqCst);
        let tmp = TempDir::new().unwrap();
        let fallback = tmp.path().join("fallback.conf");
        std::fs::write(&fallback, "# fallback").unwrap();
        let config = Config {
            conf_path: tmp.path().join("default.conf"),
            fallback_conf_path: Some(fallback),
            ..Config::default()
        };
        let emitter = ConfigEmitter::new(Box::new(NginxRenderer), vec!["true".into()]);
        let mut controller = Controller::new(&config, platform, emitter);

        controller.startup().await;

        let installed = std::fs::read_to_string(tmp.path().join("default.conf")).unwrap();
        assert_eq!(installed, "# fallback");
    }

    #[tokio::test(start_paused = true)]
    async fn file_change_triggers_reload_only() {
        let platform = Arc::new(fleet());
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("reloaded");
        let reload = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo reload >> {}", marker.display()),
        ];
        let controller = controller(Arc::clone(&platform), &tmp, reload);
        let h = start(controller, platform, tmp);

        h.file_tx.send(()).unwrap();
        sleep(Duration::from_secs(1)).await;
        h.file_tx.send(()).unwrap();
        sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists());

        sleep(Duration::from_secs(2)).await;
        for _ in 0..200 {
            if marker.exists() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let reloads = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(reloads.lines().count(), 1);
        assert_eq!(h.rebuilds(), 0);
        h.finish().await;
    }
}
