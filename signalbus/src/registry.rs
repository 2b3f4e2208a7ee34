//! 信号注册表（SignalRegistry）
//!
//! 显式构造、显式传递，不依赖全局状态。注册时校验描述并拒绝重名；
//! 可通过 `configure` 以配置项覆盖某个信号的描述。
//!
use crate::error::{SignalBusError, SignalBusResult};
use crate::signal::{Signal, SignalDescriptor, SignalOptions};
use std::collections::BTreeMap;
use std::sync::Arc;

/// 已注册的信号：描述在注册时固定
#[derive(Clone)]
pub struct RegisteredSignal {
    descriptor: SignalDescriptor,
    signal: Arc<dyn Signal>,
}

impl RegisteredSignal {
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &SignalDescriptor {
        &self.descriptor
    }

    pub fn signal(&self) -> &Arc<dyn Signal> {
        &self.signal
    }
}

#[derive(Clone, Default)]
pub struct SignalRegistry {
    by_name: BTreeMap<String, RegisteredSignal>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_signals(signals: Vec<Arc<dyn Signal>>) -> SignalBusResult<Self> {
        let mut registry = Self::new();
        for signal in signals {
            registry.register(signal)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, signal: Arc<dyn Signal>) -> SignalBusResult<()> {
        let descriptor = signal.descriptor();
        descriptor.validate()?;
        if self.by_name.contains_key(descriptor.name()) {
            return Err(SignalBusError::DuplicateSignal {
                name: descriptor.name().to_string(),
            });
        }
        self.by_name.insert(
            descriptor.name().to_string(),
            RegisteredSignal { descriptor, signal },
        );
        Ok(())
    }

    /// 链式注册
    pub fn with(mut self, signal: Arc<dyn Signal>) -> SignalBusResult<Self> {
        self.register(signal)?;
        Ok(self)
    }

    /// 以配置项覆盖已注册信号的描述
    pub fn configure(&mut self, name: &str, options: &SignalOptions) -> SignalBusResult<()> {
        let entry = self
            .by_name
            .get_mut(name)
            .ok_or_else(|| SignalBusError::UnknownSignal {
                name: name.to_string(),
            })?;
        entry.descriptor = entry.descriptor.with_options(options)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredSignal> {
        self.by_name.get(name)
    }

    pub fn require(&self, name: &str) -> SignalBusResult<&RegisteredSignal> {
        self.get(name).ok_or_else(|| SignalBusError::UnknownSignal {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// 按名称排序
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredSignal> {
        self.by_name.values()
    }

    /// 配置了排序键的信号
    pub fn ordered(&self) -> impl Iterator<Item = &RegisteredSignal> {
        self.iter().filter(|s| s.descriptor.order_by().is_some())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Publisher;
    use crate::signal::PendingEvent;
    use async_trait::async_trait;

    struct Named(&'static str, usize);

    #[async_trait]
    impl Signal for Named {
        fn descriptor(&self) -> SignalDescriptor {
            SignalDescriptor::builder()
                .name(self.0)
                .burst_count(self.1)
                .build()
        }

        async fn send_one(
            &self,
            _publisher: &mut dyn Publisher,
            _event: &PendingEvent,
        ) -> SignalBusResult<()> {
            Ok(())
        }
    }

    #[test]
    fn rejects_duplicates_and_invalid_descriptors() {
        let mut registry = SignalRegistry::new();
        registry.register(Arc::new(Named("transfer", 10))).unwrap();
        assert!(matches!(
            registry.register(Arc::new(Named("transfer", 5))),
            Err(SignalBusError::DuplicateSignal { .. })
        ));
        assert!(matches!(
            registry.register(Arc::new(Named("empty", 0))),
            Err(SignalBusError::InvalidDescriptor { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn names_are_sorted_and_configurable() {
        let mut registry = SignalRegistry::from_signals(vec![
            Arc::new(Named("zeta", 1)),
            Arc::new(Named("alpha", 1)),
        ])
        .unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["alpha", "zeta"]);
        assert_eq!(registry.ordered().count(), 0);

        let options = SignalOptions {
            burst_count: 100,
            autoflush: false,
            order_by: Some("id".into()),
        };
        registry.configure("zeta", &options).unwrap();
        let zeta = registry.require("zeta").unwrap().descriptor();
        assert_eq!(zeta.burst_count(), 100);
        assert!(!zeta.autoflush());
        assert_eq!(registry.ordered().count(), 1);

        assert!(matches!(
            registry.configure("missing", &options),
            Err(SignalBusError::UnknownSignal { .. })
        ));
    }
}
