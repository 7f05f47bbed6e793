//! In-process service registry of a separate reference domain.
//!
//! Objects registered here are reachable by name from the same process.
//! The registry lives in its own reference domain: session proxies cannot
//! be registered (their lifetime is bound to a session), and the registry's
//! own handle, [`LocalServiceRegistry::as_binder`], cannot be sent over a
//! session.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::binder::FIRST_CALL_TRANSACTION;
use crate::{Binder, CallContext, Parcel, SpBinder, Status, StatusCode};

/// Transaction code of the registry handle: name in, object out.
pub const REGISTRY_GET_SERVICE: u32 = FIRST_CALL_TRANSACTION;
/// Transaction code of the registry handle: name and object in.
pub const REGISTRY_ADD_SERVICE: u32 = FIRST_CALL_TRANSACTION + 1;
/// Transaction code of the registry handle: names out.
pub const REGISTRY_LIST_SERVICES: u32 = FIRST_CALL_TRANSACTION + 2;

const DESCRIPTOR: &str = "sockbinder.LocalServiceRegistry";

#[derive(Default)]
struct Services {
    by_name: Mutex<BTreeMap<String, SpBinder>>,
}

impl Services {
    fn add(&self, name: &str, binder: &SpBinder) -> Result<(), Status> {
        if binder.is_remote() {
            return Err(Status::with_message(
                StatusCode::FailedTransaction,
                "session proxies cannot be registered in the local registry",
            ));
        }
        let previous = self
            .by_name
            .lock()
            .insert(name.to_owned(), binder.clone());
        drop(previous);
        tracing::debug!(name, "service registered");
        Ok(())
    }

    fn get(&self, name: &str) -> Result<SpBinder, Status> {
        self.by_name.lock().get(name).cloned().ok_or_else(|| {
            Status::with_message(StatusCode::NameNotFound, format!("no service {name:?}"))
        })
    }

    fn list(&self) -> Vec<String> {
        self.by_name.lock().keys().cloned().collect()
    }
}

#[derive(Clone, Default)]
pub struct LocalServiceRegistry {
    services: Arc<Services>,
}

impl LocalServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `binder` under `name`, replacing any previous entry.
    /// Session proxies are refused with [`StatusCode::FailedTransaction`].
    pub fn add_service(&self, name: &str, binder: &SpBinder) -> Result<(), Status> {
        self.services.add(name, binder)
    }

    pub fn get_service(&self, name: &str) -> Result<SpBinder, Status> {
        self.services.get(name)
    }

    pub fn list_services(&self) -> Vec<String> {
        self.services.list()
    }

    /// Handle to the registry itself, as an object of the registry's
    /// domain.
    pub fn as_binder(&self) -> SpBinder {
        SpBinder::new_foreign(Box::new(RegistryBinder {
            services: self.services.clone(),
        }))
    }
}

struct RegistryBinder {
    services: Arc<Services>,
}

impl Binder for RegistryBinder {
    fn descriptor(&self) -> &str {
        DESCRIPTOR
    }

    fn on_transact(
        &self,
        code: u32,
        mut data: Parcel,
        cx: CallContext,
    ) -> BoxFuture<'static, Result<Parcel, Status>> {
        let services = self.services.clone();
        Box::pin(async move {
            let mut reply = cx.reply();
            match code {
                REGISTRY_GET_SERVICE => {
                    let name = data.read_str()?;
                    reply.write_binder(Some(&services.get(&name)?))?;
                }
                REGISTRY_ADD_SERVICE => {
                    let name = data.read_str()?;
                    let binder = data.read_strong_binder()?;
                    services.add(&name, &binder)?;
                }
                REGISTRY_LIST_SERVICES => {
                    let names = services.list();
                    reply.write_i32(i32::try_from(names.len()).unwrap_or(i32::MAX));
                    for name in &names {
                        reply.write_str(name);
                    }
                }
                _ => return Err(StatusCode::UnknownTransaction.into()),
            }
            Ok(reply)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactFlags;

    struct Named(&'static str);

    impl Binder for Named {
        fn descriptor(&self) -> &str {
            self.0
        }

        fn on_transact(
            &self,
            _code: u32,
            _data: Parcel,
            _cx: CallContext,
        ) -> BoxFuture<'static, Result<Parcel, Status>> {
            Box::pin(async { Err(StatusCode::UnknownTransaction.into()) })
        }
    }

    #[test]
    fn lookup_by_name() {
        let registry = LocalServiceRegistry::new();
        let service = SpBinder::new(Named("a"));
        registry.add_service("a", &service).unwrap();
        assert_eq!(registry.get_service("a").unwrap(), service);
        assert_eq!(
            registry.get_service("b").unwrap_err(),
            StatusCode::NameNotFound
        );
        assert_eq!(registry.list_services(), vec!["a".to_owned()]);
    }

    #[tokio::test]
    async fn registry_handle_speaks_transactions() {
        let registry = LocalServiceRegistry::new();
        let handle = registry.as_binder();
        assert!(handle.is_foreign());
        assert_eq!(handle.get_interface_descriptor().await.unwrap(), DESCRIPTOR);

        let service = SpBinder::new(Named("svc"));
        let mut add = Parcel::new();
        add.write_str("svc");
        add.write_binder(Some(&service)).unwrap();
        handle
            .transact(REGISTRY_ADD_SERVICE, add, TransactFlags::empty())
            .await
            .unwrap();

        let mut get = Parcel::new();
        get.write_str("svc");
        let mut reply = handle
            .transact(REGISTRY_GET_SERVICE, get, TransactFlags::empty())
            .await
            .unwrap();
        assert_eq!(reply.read_strong_binder().unwrap(), service);
    }
}
