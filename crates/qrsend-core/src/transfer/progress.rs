//! 进度与剩余时间计算
//!
//! 发送端和接收端共用同一套公式:
//!
//! - `percent = round(transferred / total * 100)`
//! - 经过 0.5 秒预热后才估算吞吐量 `transferred / elapsed`
//! - `eta = (total - transferred) / throughput`，格式为 `m:ss`
//!
//! 预热期内或吞吐量为 0/NaN/无穷大时 ETA 不可用，显示为 `--:--`。

use std::time::Duration;

/// 开始估算吞吐量之前的预热时间
pub const ETA_WARMUP: Duration = Duration::from_millis(500);

/// ETA 不可用时的显示文本
pub const UNKNOWN_ETA: &str = "--:--";

/// 单个传输的进度快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
    pub percent: u32,
    pub eta: Option<Duration>,
}

impl TransferProgress {
    /// 根据已传输字节数和经过时间计算进度
    ///
    /// `transferred` 可能超过 `total`（对端声明的大小不做校验），此时百分比大于 100。
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(transferred: u64, total: u64, elapsed: Duration) -> Self {
        let percent = if total == 0 {
            100
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let p = ((transferred as f64 / total as f64) * 100.0).round() as u32;
            p
        };

        let eta = if elapsed > ETA_WARMUP {
            let throughput = transferred as f64 / elapsed.as_secs_f64();
            if throughput.is_finite() && throughput > 0.0 {
                let remaining = total.saturating_sub(transferred) as f64 / throughput;
                Duration::try_from_secs_f64(remaining).ok()
            } else {
                None
            }
        } else {
            None
        };

        Self {
            transferred,
            total,
            percent,
            eta,
        }
    }

    /// ETA 显示文本
    pub fn eta_text(&self) -> String {
        format_eta(self.eta)
    }
}

/// 将剩余时间格式化为 `m:ss`
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(eta) => {
            let secs = eta.as_secs();
            format!("{}:{:02}", secs / 60, secs % 60)
        }
        None => UNKNOWN_ETA.to_string(),
    }
}

/// 将字节数格式化为人类可读形式，例如 `1.5 MB`
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let text = format!("{value:.2}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", text, UNITS[unit])
}
