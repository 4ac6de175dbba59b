// wifi.rs

use std::ffi::CString;

use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    handle::RawHandle,
    netif::{EspNetif, NetifStack},
    timer::EspTaskTimerService,
    wifi::{AsyncWifi, AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiDriver},
};

use crate::*;

const WIFI_RETRY: Duration = Duration::from_secs(5);
const WIFI_CHECK: Duration = Duration::from_secs(2);

pub struct WifiLoop<'a> {
    pub state: Arc<Pin<Box<MyState>>>,
    pub wifi: Option<AsyncWifi<EspWifi<'a>>>,
}

impl<'a> WifiLoop<'a> {
    pub async fn run(
        mut self,
        driver: WifiDriver<'a>,
        sysloop: EspSystemEventLoop,
        timer: EspTaskTimerService,
    ) -> anyhow::Result<()> {
        let config = self.state.config.read().await.clone();

        let sta_netif = EspNetif::new(NetifStack::Sta)?;
        let hostname = CString::new(config.hostname())?;
        // SAFETY: the netif handle is valid and the name is copied
        let err = unsafe { esp_idf_sys::esp_netif_set_hostname(sta_netif.handle(), hostname.as_ptr()) };
        if err != esp_idf_sys::ESP_OK {
            error!("Failed to set hostname: ESP error {err}");
        }

        let ap_netif = EspNetif::new(NetifStack::Ap)?;
        let esp_wifi = EspWifi::wrap_all(driver, sta_netif, ap_netif)?;
        let mut wifi = AsyncWifi::wrap(esp_wifi, sysloop, timer)?;

        let auth_method = if config.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: config.wifi_ssid.as_str().try_into().unwrap_or_default(),
            password: config.wifi_pass.as_str().try_into().unwrap_or_default(),
            auth_method,
            ..Default::default()
        }))?;

        let mac = wifi.wifi().sta_netif().get_mac()?;
        let mac_s = mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":");
        let my_id = format!("esp-env_{}", mac.iter().map(|b| format!("{b:02x}")).collect::<String>());
        info!("WiFi MAC {mac_s}, id {my_id}");
        *self.state.my_mac_s.write().await = mac_s;
        *self.state.my_id.write().await = my_id;

        info!("WiFi starting...");
        wifi.start().await?;
        self.wifi = Some(wifi);

        loop {
            self.connect(&config.wifi_ssid).await;
            Box::pin(self.stay_connected()).await?;
        }
    }

    async fn connect(&mut self, ssid: &str) {
        let Some(wifi) = self.wifi.as_mut() else {
            return;
        };
        *self.state.led_mode.write().await = LedMode::Connecting;

        loop {
            info!("WiFi connecting to {ssid}...");
            match wifi.connect().await {
                Ok(()) => match wifi.wait_netif_up().await {
                    Ok(()) => break,
                    Err(e) => error!("WiFi netif up failed: {e}"),
                },
                Err(e) => error!("WiFi connect failed: {e}"),
            }
            wifi.disconnect().await.ok();
            sleep(WIFI_RETRY).await;
        }

        match wifi.wifi().sta_netif().get_ip_info() {
            Ok(ip_info) => {
                info!("WiFi connected, IP {}", ip_info.ip);
                *self.state.ip_addr.write().await = ip_info.ip;
            }
            Err(e) => error!("WiFi ip info: {e}"),
        }
        *self.state.led_mode.write().await = LedMode::Heartbeat;
        *self.state.wifi_up.write().await = true;
    }

    async fn stay_connected(&mut self) -> anyhow::Result<()> {
        let Some(wifi) = self.wifi.as_mut() else {
            bail!("WiFi not started");
        };

        loop {
            sleep(WIFI_CHECK).await;
            if !wifi.is_connected()? {
                warn!("WiFi connection lost.");
                *self.state.wifi_up.write().await = false;
                return Ok(());
            }
        }
    }
}
// EOF
