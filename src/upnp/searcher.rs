//! UPnP 网关搜索
//!
//! 通过 SSDP 组播发现网关，确认其提供 WAN 连接服务后发出 `DeviceEvent::Found`。
//! 周期性地重新搜索，并移除长时间没有应答的网关

use super::device::{GatewayLocation, UpnpDevice, WAN_IP_CONNECTION};
use super::ssdp::{self, SEARCH_REQUEST, SSDP_MULTICAST_GROUPS};
use super::transport::HttpTransport;
use crate::nat::{DeviceEvent, GatewayIdentity, NatDevice, Searcher};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// 搜索参数
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// 重新搜索和清理的周期
    pub search_period: Duration,
    /// 超过该时长没有应答的网关会被移除
    pub device_ttl: Duration,
    /// 同一应答方在该时间窗内只获取一次设备描述
    pub fetch_debounce: Duration,
    /// 搜索请求发往的组播地址
    pub multicast_groups: Vec<SocketAddr>,
    /// 需要网关提供的服务类型
    pub service_type: String,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            search_period: Duration::from_secs(5 * 60),
            device_ttl: Duration::from_secs(10 * 60),
            fetch_debounce: Duration::from_secs(20),
            multicast_groups: SSDP_MULTICAST_GROUPS.to_vec(),
            service_type: WAN_IP_CONNECTION.to_string(),
        }
    }
}

/// 搜索器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Idle,
    Searching,
}

/// 受同一把锁保护的设备集合
#[derive(Default)]
struct DeviceSet {
    devices: HashMap<GatewayIdentity, Arc<UpnpDevice>>,
    /// 应答方地址 -> 最近一次开始获取描述的时间
    last_fetched: HashMap<IpAddr, Instant>,
}

struct SearcherInner {
    options: SearchOptions,
    transport: Arc<dyn HttpTransport>,
    set: Mutex<DeviceSet>,
    sockets: Mutex<Vec<Arc<UdpSocket>>>,
    /// 应答方地址 -> 访问它所用的本机地址
    local_addresses: Mutex<HashMap<IpAddr, IpAddr>>,
    events: broadcast::Sender<DeviceEvent>,
}

/// UPnP 网关搜索器
pub struct UpnpSearcher {
    inner: Arc<SearcherInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UpnpSearcher {
    pub fn new(options: SearchOptions, transport: Arc<dyn HttpTransport>) -> Self {
        let (events, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(SearcherInner {
                options,
                transport,
                set: Mutex::new(DeviceSet::default()),
                sockets: Mutex::new(Vec::new()),
                local_addresses: Mutex::new(HashMap::new()),
                events,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SearchState {
        if lock(&self.tasks).is_empty() {
            SearchState::Idle
        } else {
            SearchState::Searching
        }
    }

    /// 开始搜索：绑定套接字、发出首轮搜索请求并启动周期任务
    pub async fn start(&self) -> io::Result<()> {
        if self.state() == SearchState::Searching {
            return Ok(());
        }

        let sockets = self.bind_sockets().await?;

        {
            let mut tasks = lock(&self.tasks);
            if !tasks.is_empty() {
                return Ok(());
            }

            *lock(&self.inner.sockets) = sockets.clone();
            for socket in sockets {
                tasks.push(tokio::spawn(receive_loop(self.inner.clone(), socket)));
            }
            tasks.push(tokio::spawn(search_loop(self.inner.clone())));
        }

        info!("开始搜索 UPnP 网关");
        self.inner.probe().await;
        Ok(())
    }

    /// 停止周期搜索；进行中的描述获取会继续完成
    pub fn stop(&self) {
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        if tasks.is_empty() {
            return;
        }

        for task in tasks {
            task.abort();
        }
        lock(&self.inner.sockets).clear();
        lock(&self.inner.local_addresses).clear();
        info!("停止搜索 UPnP 网关");
    }

    /// 网络地址变化后重新开始搜索
    pub async fn restart(&self) -> io::Result<()> {
        self.stop();
        self.start().await
    }

    /// 发送一轮搜索请求
    pub async fn probe(&self) {
        self.inner.probe().await;
    }

    /// 清理过期网关，对仍然存活的网关重新发出发现事件，然后再次搜索
    pub async fn reconcile(&self) {
        self.inner.reconcile().await;
    }

    /// 处理一个 SSDP 应答
    ///
    /// 需要获取设备描述时返回该后台任务的句柄
    pub fn handle_datagram(&self, local_address: IpAddr, payload: &[u8], from: SocketAddr) -> Option<JoinHandle<()>> {
        self.inner.handle_datagram(local_address, payload, from)
    }

    /// 当前已知的网关
    pub fn devices(&self) -> Vec<Arc<UpnpDevice>> {
        lock(&self.inner.set).devices.values().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    async fn bind_sockets(&self) -> io::Result<Vec<Arc<UdpSocket>>> {
        let mut sockets = Vec::new();
        let groups = &self.inner.options.multicast_groups;

        if groups.iter().any(|g| g.is_ipv4()) {
            sockets.push(Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?));
        }
        if groups.iter().any(|g| g.is_ipv6()) {
            match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await {
                Ok(socket) => sockets.push(Arc::new(socket)),
                Err(e) => warn!("无法绑定 IPv6 套接字: {}", e),
            }
        }

        Ok(sockets)
    }
}

impl Drop for UpnpSearcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl Searcher for UpnpSearcher {
    async fn start(&self) -> io::Result<()> {
        UpnpSearcher::start(self).await
    }

    fn stop(&self) {
        UpnpSearcher::stop(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        UpnpSearcher::subscribe(self)
    }
}

impl SearcherInner {
    fn handle_datagram(self: &Arc<Self>, local_address: IpAddr, payload: &[u8], from: SocketAddr) -> Option<JoinHandle<()>> {
        let text = String::from_utf8_lossy(payload);

        let Some(service) = ssdp::gateway_service(&text) else {
            trace!("{}: 忽略非网关应答", from);
            return None;
        };
        debug!("{}: 网关声明了 '{}' 服务", from, service);

        let Some(identity) = ssdp::parse_location(&text) else {
            debug!("{}: 无法解析 Location: {}", from, text);
            return None;
        };

        {
            let mut set = lock(&self.set);
            if let Some(device) = set.devices.get(&identity) {
                device.touch();
                return None;
            }

            // 一轮搜索会收到同一网关的多个应答，只获取一次服务列表
            let now = Instant::now();
            if let Some(last) = set.last_fetched.get(&from.ip()) {
                if now.duration_since(*last) < self.options.fetch_debounce {
                    return None;
                }
            }
            set.last_fetched.insert(from.ip(), now);
        }

        let location = GatewayLocation {
            identity,
            local_address,
            service_type: self.options.service_type.clone(),
        };
        let inner = self.clone();
        Some(tokio::spawn(async move { inner.complete_setup(location).await }))
    }

    async fn complete_setup(&self, location: GatewayLocation) {
        let host = location.identity.host;

        let device = match location.fetch_description(self.transport.clone()).await {
            Ok(Some(device)) => Arc::new(device),
            Ok(None) => {
                debug!("{}: 没有 {} 服务", host, self.options.service_type);
                return;
            }
            Err(e) => {
                debug!("{}: 获取服务列表失败: {}", host, e);
                return;
            }
        };

        {
            let mut set = lock(&self.set);
            if set.devices.contains_key(device.identity()) {
                return;
            }
            set.devices.insert(device.identity().clone(), device.clone());
        }

        info!("发现网关: {}", device);
        let _ = self.events.send(DeviceEvent::Found(device));
    }

    async fn reconcile(&self) {
        let now = Instant::now();
        let ttl = self.options.device_ttl;
        let debounce = self.options.fetch_debounce;

        let (lost, live) = {
            let mut set = lock(&self.set);
            let stale: Vec<GatewayIdentity> = set
                .devices
                .iter()
                .filter(|(_, d)| now.duration_since(d.last_seen()) > ttl)
                .map(|(id, _)| id.clone())
                .collect();
            let lost: Vec<_> = stale.iter().filter_map(|id| set.devices.remove(id)).collect();
            set.last_fetched.retain(|_, at| now.duration_since(*at) < debounce);
            (lost, set.devices.values().cloned().collect::<Vec<_>>())
        };

        for device in lost {
            info!("网关长时间无应答，移除: {}", device.identity());
            let _ = self.events.send(DeviceEvent::Lost(device));
        }
        for device in live {
            let _ = self.events.send(DeviceEvent::Found(device));
        }

        self.probe().await;
    }

    async fn probe(&self) {
        let sockets = lock(&self.sockets).clone();
        if sockets.is_empty() {
            trace!("搜索器未启动，跳过搜索");
            return;
        }

        let mut sent = 0;
        for group in &self.options.multicast_groups {
            let Some(socket) = sockets.iter().find(|s| {
                s.local_addr()
                    .map(|a| a.is_ipv4() == group.is_ipv4())
                    .unwrap_or(false)
            }) else {
                continue;
            };

            // 没有 IPv6 路由的主机上 IPv6 组总会失败
            match socket.send_to(SEARCH_REQUEST.as_bytes(), *group).await {
                Ok(_) => {
                    sent += 1;
                    trace!("发送搜索请求到 {}", group);
                }
                Err(e) => debug!("发送搜索请求到 {} 失败: {}", group, e),
            }
        }

        if sent == 0 {
            warn!("搜索请求未能发往任何组播地址");
        }
    }

    /// 网关应答对应的本机地址，非网关应答返回 None
    ///
    /// 同一应答方只解析一次本机地址
    async fn local_address_for_reply(&self, payload: &[u8], from: SocketAddr) -> Option<IpAddr> {
        if ssdp::gateway_service(&String::from_utf8_lossy(payload)).is_none() {
            trace!("{}: 忽略非网关应答", from);
            return None;
        }

        let cached = lock(&self.local_addresses).get(&from.ip()).copied();
        if cached.is_some() {
            return cached;
        }

        match local_address_for(from).await {
            Ok(address) => {
                lock(&self.local_addresses).insert(from.ip(), address);
                Some(address)
            }
            Err(e) => {
                debug!("{}: 无法确定本机地址: {}", from, e);
                None
            }
        }
    }
}

async fn receive_loop(inner: Arc<SearcherInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 4096];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("接收 SSDP 应答失败: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(local_address) = inner.local_address_for_reply(&buf[..len], from).await else {
            continue;
        };

        inner.handle_datagram(local_address, &buf[..len], from);
    }
}

async fn search_loop(inner: Arc<SearcherInner>) {
    let period = inner.options.search_period;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;
        inner.reconcile().await;
    }
}

/// 访问远端时所用的本机地址
async fn local_address_for(remote: SocketAddr) -> io::Result<IpAddr> {
    let unspecified: IpAddr = if remote.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };

    let socket = UdpSocket::bind((unspecified, 0)).await?;
    socket.connect(remote).await?;
    Ok(socket.local_addr()?.ip())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upnp::transport::mock::MockTransport;
    use crate::upnp::transport::HttpResponse;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::timeout;

    const REPLY: &[u8] = b"HTTP/1.1 200 OK\r\n\
        CACHE-CONTROL: max-age=120\r\n\
        ST: urn:schemas-upnp-org:service:WANIPConnection:1\r\n\
        LOCATION: http://192.168.1.1:5000/rootDesc.xml\r\n\
        \r\n";

    const DESCRIPTION: &str = r#"<?xml version="1.0"?>
        <root xmlns="urn:schemas-upnp-org:device-1-0"><device><serviceList>
          <service>
            <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
            <controlURL>/ctl/IPConn</controlURL>
          </service>
        </serviceList></device></root>"#;

    fn responder() -> SocketAddr {
        "192.168.1.1:1900".parse().unwrap()
    }

    fn local() -> IpAddr {
        "192.168.1.10".parse().unwrap()
    }

    fn searcher(transport: Arc<MockTransport>) -> UpnpSearcher {
        UpnpSearcher::new(SearchOptions::default(), transport)
    }

    fn count_found(rx: &mut broadcast::Receiver<DeviceEvent>) -> (usize, usize) {
        let (mut found, mut lost) = (0, 0);
        loop {
            match rx.try_recv() {
                Ok(DeviceEvent::Found(_)) => found += 1,
                Ok(DeviceEvent::Lost(_)) => lost += 1,
                Err(TryRecvError::Empty) => return (found, lost),
                Err(e) => panic!("unexpected receive error: {:?}", e),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_replies_fetch_once() {
        let transport = Arc::new(MockTransport::new(|_| Ok(HttpResponse::ok(DESCRIPTION))));
        let searcher = searcher(transport.clone());
        let mut rx = searcher.subscribe();

        let fetch = searcher.handle_datagram(local(), REPLY, responder());
        assert!(searcher.handle_datagram(local(), REPLY, responder()).is_none());
        fetch.unwrap().await.unwrap();

        // 描述获取完成后再收到应答只刷新可见时间
        assert!(searcher.handle_datagram(local(), REPLY, responder()).is_none());

        assert_eq!(transport.requests().len(), 1);
        assert_eq!(count_found(&mut rx), (1, 0));
        assert_eq!(searcher.devices().len(), 1);
        assert_eq!(
            searcher.devices()[0].control_url(),
            "http://192.168.1.1:5000/ctl/IPConn"
        );
        assert_eq!(searcher.devices()[0].local_address(), local());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_expires_after_window() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(HttpResponse {
                status: 500,
                body: String::new(),
            })
        }));
        let searcher = searcher(transport.clone());
        let mut rx = searcher.subscribe();

        searcher
            .handle_datagram(local(), REPLY, responder())
            .unwrap()
            .await
            .unwrap();
        assert!(searcher.handle_datagram(local(), REPLY, responder()).is_none());

        tokio::time::advance(Duration::from_secs(21)).await;
        searcher
            .handle_datagram(local(), REPLY, responder())
            .unwrap()
            .await
            .unwrap();

        assert_eq!(transport.requests().len(), 2);
        assert_eq!(count_found(&mut rx), (0, 0));
        assert!(searcher.devices().is_empty());
    }

    #[tokio::test]
    async fn test_ignores_non_gateway_replies() {
        let transport = Arc::new(MockTransport::new(|_| Ok(HttpResponse::ok(DESCRIPTION))));
        let searcher = searcher(transport.clone());

        let printer = b"HTTP/1.1 200 OK\r\n\
            ST: urn:schemas-upnp-org:device:Printer:1\r\n\
            LOCATION: http://192.168.1.7/desc.xml\r\n\r\n";
        assert!(searcher.handle_datagram(local(), printer, responder()).is_none());
        assert!(searcher.handle_datagram(local(), &[0xff, 0xfe, 0x00], responder()).is_none());

        let no_location = b"HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:service:WANIPConnection:1\r\n\r\n";
        assert!(searcher.handle_datagram(local(), no_location, responder()).is_none());

        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_without_wan_service_is_dropped() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(HttpResponse::ok(DESCRIPTION.replace("WANIPConnection", "WANPPPConnection")))
        }));
        let searcher = searcher(transport);
        let mut rx = searcher.subscribe();

        searcher
            .handle_datagram(local(), REPLY, responder())
            .unwrap()
            .await
            .unwrap();
        assert!(searcher.devices().is_empty());
        assert_eq!(count_found(&mut rx), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_prunes_stale_devices() {
        let transport = Arc::new(MockTransport::new(|_| Ok(HttpResponse::ok(DESCRIPTION))));
        let searcher = searcher(transport);
        let mut rx = searcher.subscribe();

        searcher
            .handle_datagram(local(), REPLY, responder())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(count_found(&mut rx), (1, 0));

        // 仍在存活窗口内：重新发出发现事件
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        searcher.reconcile().await;
        assert_eq!(count_found(&mut rx), (1, 0));

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        searcher.reconcile().await;
        assert_eq!(count_found(&mut rx), (0, 1));
        assert!(searcher.devices().is_empty());

        searcher.reconcile().await;
        assert_eq!(count_found(&mut rx), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_refreshes_last_seen() {
        let transport = Arc::new(MockTransport::new(|_| Ok(HttpResponse::ok(DESCRIPTION))));
        let searcher = searcher(transport);
        let mut rx = searcher.subscribe();

        searcher
            .handle_datagram(local(), REPLY, responder())
            .unwrap()
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        assert!(searcher.handle_datagram(local(), REPLY, responder()).is_none());
        tokio::time::advance(Duration::from_secs(9 * 60)).await;

        searcher.reconcile().await;
        assert_eq!(count_found(&mut rx), (2, 0));
        assert_eq!(searcher.devices().len(), 1);
    }

    #[tokio::test]
    async fn test_start_probes_and_handles_replies() {
        let gateway = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let options = SearchOptions {
            multicast_groups: vec![gateway.local_addr().unwrap()],
            ..SearchOptions::default()
        };
        let transport = Arc::new(MockTransport::new(|_| Ok(HttpResponse::ok(DESCRIPTION))));
        let searcher = UpnpSearcher::new(options, transport.clone());
        let mut rx = searcher.subscribe();

        searcher.start().await.unwrap();
        searcher.start().await.unwrap();
        assert_eq!(searcher.state(), SearchState::Searching);

        // 重复启动不会再发一轮搜索
        let mut buf = [0u8; 1024];
        let (len, search_from) = timeout(Duration::from_secs(5), gateway.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], SEARCH_REQUEST.as_bytes());
        assert!(timeout(Duration::from_millis(200), gateway.recv_from(&mut buf))
            .await
            .is_err());

        gateway.send_to(REPLY, search_from).await.unwrap();
        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let DeviceEvent::Found(device) = event else {
            panic!("expected a found event");
        };
        assert_eq!(device.identity().host, "192.168.1.1:5000".parse().unwrap());
        assert_eq!(device.local_address(), IpAddr::from(Ipv4Addr::LOCALHOST));
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(searcher.devices().len(), 1);

        searcher.stop();
        assert_eq!(searcher.state(), SearchState::Idle);
    }

    #[tokio::test]
    async fn test_local_address_resolved_only_for_gateway_replies() {
        let transport = Arc::new(MockTransport::new(|_| Ok(HttpResponse::ok(DESCRIPTION))));
        let searcher = searcher(transport);
        let from: SocketAddr = "127.0.0.1:1900".parse().unwrap();

        let printer = b"HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:device:Printer:1\r\n\r\n";
        assert!(searcher.inner.local_address_for_reply(printer, from).await.is_none());
        assert!(lock(&searcher.inner.local_addresses).is_empty());

        let resolved = searcher.inner.local_address_for_reply(REPLY, from).await;
        assert_eq!(resolved, Some(IpAddr::from(Ipv4Addr::LOCALHOST)));

        // 之后的应答直接使用缓存
        lock(&searcher.inner.local_addresses).insert(from.ip(), local());
        assert_eq!(
            searcher.inner.local_address_for_reply(REPLY, from).await,
            Some(local())
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let transport = Arc::new(MockTransport::new(|_| Ok(HttpResponse::ok(DESCRIPTION))));
        let searcher = searcher(transport);
        assert_eq!(searcher.state(), SearchState::Idle);
        searcher.stop();
        searcher.stop();
        assert_eq!(searcher.state(), SearchState::Idle);
    }
}
