//! 重试与退避
//!
//! 指数退避加 ±抖动，供两处使用：
//! - 数据库序列化冲突时重跑整个批次/工作单元；
//! - 投递通道断线后的重连循环。
//!
use rand::Rng;
use std::time::Duration;

/// 指数退避参数
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    /// 第一次重试前的等待
    pub initial: Duration,
    /// 单次等待上限
    pub max: Duration,
    /// 每次翻倍的倍率
    pub multiplier: f64,
    /// 抖动比例（0.0 ~ 1.0）
    pub jitter: f64,
}

impl Backoff {
    /// 第 `attempt` 次失败（从 1 开始）之后的等待时长
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max.as_secs_f64());
        Duration::from_secs_f64(apply_jitter(capped, self.jitter).min(self.max.as_secs_f64()))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

fn apply_jitter(secs: f64, jitter: f64) -> f64 {
    if jitter <= 0.0 || secs <= 0.0 {
        return secs;
    }
    let range = secs * jitter.clamp(0.0, 1.0);
    let offset = rand::thread_rng().gen_range(-range..=range);
    (secs + offset).max(0.0)
}

/// 重试策略：`max_attempts` 含首次尝试
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// 冲突重试：首次 + 11 次重试，最长等待 1 秒
    pub fn conflicts() -> Self {
        Self {
            max_attempts: 12,
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: 0.5,
            },
        }
    }

    /// 重连：5 次尝试，100ms 起步，最长 30 秒
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }

    /// 第 `attempt` 次失败后是否还能再试
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::conflicts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff {
            initial: Duration::from_millis(400),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.25,
        };
        for _ in 0..100 {
            let d = backoff.delay(1);
            assert!(d >= Duration::from_millis(300) && d <= Duration::from_millis(500));
        }
    }

    #[test]
    fn attempts_include_the_first_try() {
        let policy = RetryPolicy::conflicts();
        assert!(policy.allows_retry(11));
        assert!(!policy.allows_retry(12));
        assert!(!RetryPolicy::none().allows_retry(1));
    }
}
