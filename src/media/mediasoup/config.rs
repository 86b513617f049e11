#![forbid(unsafe_code)]

// Configuration for mediasoup workers, routers and WebRTC servers

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerDtlsFiles, WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

const fn non_zero_u32(value: u32) -> NonZeroU32 {
    match NonZeroU32::new(value) {
        Some(v) => v,
        None => panic!("value must be non-zero"),
    }
}

const AUDIO_CLOCK_RATE: NonZeroU32 = non_zero_u32(48_000);
const VIDEO_CLOCK_RATE: NonZeroU32 = non_zero_u32(90_000);
const STEREO: NonZeroU8 = match NonZeroU8::new(2) {
    Some(v) => v,
    None => panic!("channel count must be non-zero"),
};

/// Everything the mediasoup engine needs at startup
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    /// Worker `i` listens for RTC traffic on `webrtc_server_port_base + i`
    pub webrtc_server_port_base: u16,
    /// Address advertised in ICE candidates, for hosts behind NAT
    pub announced_address: Option<String>,
    /// Audio level observer tuning
    pub audio_level: AudioLevelConfig,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            worker_config: WorkerConfig::default(),
            router_config: RouterConfig::default(),
            webrtc_server_port_base: 40_000,
            announced_address: None,
            audio_level: AudioLevelConfig::default(),
        }
    }
}

impl MediaConfig {
    /// Advertise `public_ip` instead of the bound address
    pub fn with_announced_ip(mut self, public_ip: Option<IpAddr>) -> Self {
        self.announced_address = public_ip.map(|ip| ip.to_string());
        self
    }

    /// Listen info for the WebRTC server of the worker at `index`
    pub fn listen_info(&self, index: usize) -> ListenInfo {
        let offset = u16::try_from(index).unwrap_or(u16::MAX);
        ListenInfo {
            protocol: Protocol::Udp,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: self.announced_address.clone(),
            port: Some(self.webrtc_server_port_base.saturating_add(offset)),
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub dtls_certificate_file: Option<String>,
    pub dtls_private_key_file: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 10_000,
            rtc_max_port: 59_999,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

impl WorkerConfig {
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();

        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;

        if let (Some(cert), Some(key)) = (&self.dtls_certificate_file, &self.dtls_private_key_file) {
            settings.dtls_files = Some(WorkerDtlsFiles {
                certificate: cert.clone().into(),
                private_key: key.clone().into(),
            });
        }

        settings
    }
}

/// Router codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Opus for audio, VP8 and H264 for camera and screen video
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        let video_feedback = || {
            vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ]
        };

        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(111),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: STEREO,
                parameters: RtpCodecParametersParameters::from([
                    ("minptime", 10_u32.into()),
                    ("useinbandfec", 1_u32.into()),
                ]),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: Some(96),
                clock_rate: VIDEO_CLOCK_RATE,
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: video_feedback(),
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: Some(102),
                clock_rate: VIDEO_CLOCK_RATE,
                parameters: RtpCodecParametersParameters::from([
                    ("level-asymmetry-allowed", 1_u32.into()),
                    ("packetization-mode", 1_u32.into()),
                    ("profile-level-id", "42e01f".into()),
                ]),
                rtcp_feedback: video_feedback(),
            },
        ]
    }

    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// Audio level observer settings
#[derive(Debug, Clone, Copy)]
pub struct AudioLevelConfig {
    pub max_entries: u16,
    /// dBov; quieter producers count as silent
    pub threshold: i8,
    /// Reporting interval in milliseconds
    pub interval: u16,
}

impl Default for AudioLevelConfig {
    fn default() -> Self {
        Self {
            max_entries: 10,
            threshold: -60,
            interval: 800,
        }
    }
}

impl AudioLevelConfig {
    pub fn to_observer_options(self) -> AudioLevelObserverOptions {
        let mut opts = AudioLevelObserverOptions::default();
        if let Some(max_entries) = std::num::NonZeroU16::new(self.max_entries) {
            opts.max_entries = max_entries;
        }
        opts.threshold = self.threshold;
        opts.interval = self.interval;
        opts
    }
}
