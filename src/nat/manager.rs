//! 端口映射管理器
//!
//! 持有期望的映射，把它应用到所有已知网关上，并定期检查映射是否仍然存在。
//!
//! 生命周期操作 (启动、停止、改端口) 按调用顺序进入同一个任务队列依次执行，
//! 每个操作内部对各个网关的请求并发进行。单个网关的失败只记录日志，
//! 不会影响其他网关，也不会返回给调用方。

use super::{DeviceEvent, GatewayIdentity, MappingError, NatDevice, PortMapping, Protocol, Searcher};
use futures_util::future::{join_all, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Job = BoxFuture<'static, ()>;

/// 管理器参数
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub protocol: Protocol,
    /// 映射描述前缀，完整描述为 "<前缀>: <本机地址>"
    pub description: String,
    /// 映射租期 (秒)
    pub lease: u32,
    /// 定期检查映射的周期
    pub check_period: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            description: "upnp-portmap".to_string(),
            lease: 0,
            check_period: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    /// 事件监听和定期检查任务
    tasks: Vec<JoinHandle<()>>,
}

struct ManagerInner {
    searcher: Arc<dyn Searcher>,
    options: ManagerOptions,
    desired: Mutex<PortMapping>,
    devices: Mutex<HashMap<GatewayIdentity, Arc<dyn NatDevice>>>,
    lifecycle: Mutex<Lifecycle>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

/// 端口映射管理器
pub struct NatManager {
    inner: Arc<ManagerInner>,
}

impl NatManager {
    /// 创建管理器，内部端口与外部端口相同
    pub fn new(searcher: Arc<dyn Searcher>, port: u16, options: ManagerOptions) -> Self {
        let desired = PortMapping::new(options.protocol, port as i32, port as i32);

        Self {
            inner: Arc::new(ManagerInner {
                searcher,
                options,
                desired: Mutex::new(desired),
                devices: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(Lifecycle::default()),
                queue: Mutex::new(None),
            }),
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.inner.lifecycle).started
    }

    /// 当前期望的外部端口
    pub fn port(&self) -> u16 {
        lock(&self.inner.desired).public_port as u16
    }

    /// 当前已知的网关
    pub fn devices(&self) -> Vec<Arc<dyn NatDevice>> {
        self.inner.snapshot()
    }

    /// 修改端口
    ///
    /// 未启动时只记录新端口；已启动时先在所有网关上删除旧映射，再添加新映射
    pub fn set_port(&self, port: u16) {
        let (old, new) = {
            let mut desired = lock(&self.inner.desired);
            if desired.public_port == port as i32 {
                return;
            }
            let new = PortMapping::new(self.inner.options.protocol, port as i32, port as i32);
            (std::mem::replace(&mut *desired, new.clone()), new)
        };

        if !self.is_started() {
            return;
        }

        info!("映射端口变更: {} -> {}", old.public_port, new.public_port);
        let inner = self.inner.clone();
        self.inner.schedule(async move { inner.replace_mapping_all(old, new).await });
    }

    /// 启动：开始搜索网关，把映射应用到所有已知网关，并开启定期检查
    pub async fn start(&self) {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.started {
                return;
            }
            lifecycle.started = true;

            let events = self.inner.searcher.subscribe();
            let weak = Arc::downgrade(&self.inner);
            lifecycle.tasks.push(tokio::spawn(listen(weak.clone(), events)));
            lifecycle
                .tasks
                .push(tokio::spawn(check_loop(weak, self.inner.options.check_period)));
        }

        info!("端口映射管理器启动, 端口 {}", self.port());

        if let Err(e) = self.inner.searcher.start().await {
            warn!("启动网关搜索失败: {}", e);
        }

        let inner = self.inner.clone();
        self.inner.schedule(async move { inner.add_mapping_all().await });
    }

    /// 停止：从所有网关删除映射，停止搜索和定期检查
    pub fn stop(&self) {
        let tasks: Vec<_> = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if !lifecycle.started {
                return;
            }
            lifecycle.started = false;
            lifecycle.tasks.drain(..).collect()
        };

        let mapping = self.inner.desired();
        let inner = self.inner.clone();
        self.inner
            .schedule(async move { inner.remove_mapping_all(mapping).await });

        self.inner.searcher.stop();
        for task in tasks {
            task.abort();
        }
        info!("端口映射管理器已停止");
    }

    /// 网关被发现或刷新
    pub fn on_device_found(&self, device: Arc<dyn NatDevice>) {
        self.inner.device_found(device);
    }

    /// 网关消失
    pub fn on_device_lost(&self, device: &Arc<dyn NatDevice>) {
        self.inner.device_lost(device);
    }

    /// 安排一次映射检查，缺失映射的网关会重新添加
    pub fn check_mappings(&self) {
        self.inner.check_mappings();
    }

    /// 等待此前排队的操作全部完成
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.inner.schedule(async move {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

impl Drop for NatManager {
    fn drop(&mut self) {
        for task in lock(&self.inner.lifecycle).tasks.drain(..) {
            task.abort();
        }
    }
}

impl ManagerInner {
    fn desired(&self) -> PortMapping {
        lock(&self.desired).clone()
    }

    fn snapshot(&self) -> Vec<Arc<dyn NatDevice>> {
        lock(&self.devices).values().cloned().collect()
    }

    /// 该网关上由本管理器创建的映射描述
    fn tag_for(&self, device: &Arc<dyn NatDevice>) -> String {
        format!("{}: {}", self.options.description, device.local_address())
    }

    /// 把任务追加到队列末尾；队列任务在第一次调度时启动
    fn schedule<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut queue = lock(&self.queue);
        let sender = queue.get_or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    if let Err(e) = tokio::spawn(job).await {
                        warn!("映射任务异常结束: {}", e);
                    }
                }
            });
            tx
        });

        if sender.send(job.boxed()).is_err() {
            warn!("映射任务队列已关闭");
        }
    }

    fn device_found(self: &Arc<Self>, device: Arc<dyn NatDevice>) {
        lock(&self.devices).insert(device.identity().clone(), device.clone());

        let inner = self.clone();
        self.schedule(async move {
            let tag = inner.tag_for(&device);
            let stale: Vec<_> = inner
                .get_all_mappings(&device)
                .await
                .into_iter()
                .filter(|m| m.description == tag)
                .collect();
            for mapping in &stale {
                inner.remove_port_map(&device, mapping).await;
            }

            let desired = inner.desired();
            inner.create_port_map(&device, &desired).await;
        });
    }

    fn device_lost(&self, device: &Arc<dyn NatDevice>) {
        if lock(&self.devices).remove(device.identity()).is_some() {
            debug!("网关已移除: {}", device.identity());
        }
    }

    fn check_mappings(self: &Arc<Self>) {
        let inner = self.clone();
        self.schedule(async move { inner.check_all().await });
    }

    async fn check_all(&self) {
        let desired = self.desired();
        let devices = self.snapshot();

        join_all(devices.iter().map(|device| {
            let desired = &desired;
            async move {
                let present = self
                    .get_all_mappings(device)
                    .await
                    .iter()
                    .any(|m| m.public_port == desired.public_port);
                if !present {
                    debug!("{}: 映射 {} 丢失，重新添加", device.identity(), desired.public_port);
                    self.create_port_map(device, desired).await;
                }
            }
        }))
        .await;
    }

    async fn add_mapping_all(&self) {
        let desired = self.desired();
        let devices = self.snapshot();
        join_all(devices.iter().map(|d| self.create_port_map(d, &desired))).await;
    }

    async fn remove_mapping_all(&self, mapping: PortMapping) {
        let devices = self.snapshot();
        join_all(devices.iter().map(|d| self.remove_port_map(d, &mapping))).await;
    }

    /// 每个网关上先删旧映射再加新映射，网关之间并发
    async fn replace_mapping_all(&self, old: PortMapping, new: PortMapping) {
        let devices = self.snapshot();
        join_all(devices.iter().map(|device| {
            let (old, new) = (&old, &new);
            async move {
                self.remove_port_map(device, old).await;
                self.create_port_map(device, new).await;
            }
        }))
        .await;
    }

    async fn get_all_mappings(&self, device: &Arc<dyn NatDevice>) -> Vec<PortMapping> {
        match device.list_all_mappings().await {
            Ok(mappings) => mappings,
            Err(e) => {
                log_failure(device, "枚举映射", &e);
                Vec::new()
            }
        }
    }

    async fn create_port_map(&self, device: &Arc<dyn NatDevice>, desired: &PortMapping) {
        let mapping = PortMapping::with_lifetime(
            desired.protocol,
            desired.private_port,
            desired.public_port,
            self.options.lease,
        )
        .described(self.tag_for(device));

        match device.create_mapping(&mapping).await {
            Ok(()) => info!("{}: 已添加映射 {}", device.identity(), mapping),
            Err(e) => log_failure(device, "添加映射", &e),
        }
    }

    async fn remove_port_map(&self, device: &Arc<dyn NatDevice>, mapping: &PortMapping) {
        match device.delete_mapping(mapping).await {
            Ok(()) => info!("{}: 已删除映射 {}", device.identity(), mapping),
            Err(e) => log_failure(device, "删除映射", &e),
        }
    }
}

fn log_failure(device: &Arc<dyn NatDevice>, operation: &str, error: &MappingError) {
    if error.is_fault() {
        debug!("{}: 网关拒绝{}: {}", device.identity(), operation, error);
    } else {
        warn!("{}: {}失败: {}", device.identity(), operation, error);
    }
}

async fn listen(inner: Weak<ManagerInner>, mut events: broadcast::Receiver<DeviceEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("跳过了 {} 个网关事件", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            DeviceEvent::Found(device) => inner.device_found(device),
            DeviceEvent::Lost(device) => inner.device_lost(&device),
        }
    }
}

async fn check_loop(inner: Weak<ManagerInner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.check_mappings();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
