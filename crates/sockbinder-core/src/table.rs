//! Per-session reference table.
//!
//! Every object that has crossed the session boundary has one entry here,
//! keyed by its wire address:
//!
//! - **local** entries describe objects owned by this process. The entry
//!   holds a strong reference (`sent_ref`) for as long as the peer holds any
//!   strong reference (`times_sent > 0`), and the per-object oneway queue.
//! - **remote** entries describe objects owned by the peer. The entry holds
//!   only a weak pointer to the proxy, so proxy identity is stable while any
//!   strong reference exists, and counts how many strong references the
//!   peer has handed us (`times_recd`). When the proxy dies that many are
//!   released with a single `DecStrong`.
//!
//! Messages travel over several connections, so a `DecStrong` can overtake
//! an earlier message that still names the object. Each side therefore
//! counts mentions: the proxy side tallies every message naming a remote
//! address and reports the tally in its `DecStrong`; the owner adds one per
//! message it receives naming the address and subtracts the reported tally.
//! A negative balance means mentions are still in flight and the object is
//! kept alive until they arrive.
//!
//! The table never runs foreign code under its lock: anything whose drop
//! might re-enter (objects, parcels, proxies) is handed back to the caller
//! and dropped after the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::binder::BinderObject;
use crate::wire::{ADDRESS_SERVER_BIT, Message, SPECIAL_ADDRESS};
use crate::{Parcel, RpcSession, SpBinder, Status, StatusCode};

/// A oneway transaction waiting for its turn on one object.
pub(crate) struct PendingOneway {
    pub target: SpBinder,
    pub code: u32,
    pub data: Parcel,
    pub async_number: u64,
}

struct LocalEntry {
    object: Weak<BinderObject>,
    sent_ref: Option<SpBinder>,
    times_sent: u64,
    /// Mentions received minus mentions the peer reported.
    mentions: i64,
    /// Async number the next oneway transaction must carry.
    next_async: u64,
    async_running: bool,
    async_todo: BTreeMap<u64, PendingOneway>,
}

impl LocalEntry {
    fn is_released(&self) -> bool {
        self.times_sent == 0 && self.mentions >= 0
    }

    fn is_idle(&self) -> bool {
        self.is_released() && !self.async_running && self.async_todo.is_empty()
    }
}

struct RemoteEntry {
    proxy: Weak<BinderObject>,
    times_recd: u64,
    weak: u64,
    /// Messages naming this address written since the last `DecStrong`.
    mentions: u64,
    /// Async number for the next oneway transaction we send.
    next_async: u64,
}

enum Entry {
    Local(LocalEntry),
    Remote(RemoteEntry),
}

/// Values released by the table, dropped by the caller outside the lock.
#[must_use = "released references must be dropped outside the table lock"]
#[derive(Default)]
pub(crate) struct Released {
    binders: Vec<SpBinder>,
    pending: Vec<PendingOneway>,
}

impl Released {
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.binders.is_empty() && self.pending.is_empty()
    }
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<u64, Entry>,
    /// Local object pointer to address. Entries hold a `Weak` to the object,
    /// which keeps the allocation (and thus the pointer) from being reused.
    local_index: HashMap<usize, u64>,
    next_address: u64,
    /// Async counters of remote entries that were erased, so a re-created
    /// proxy continues the owner's sequence.
    retired_async: HashMap<u64, u64>,
    /// Housekeeping messages waiting for the next write.
    outbox: Vec<Message>,
    terminated: bool,
}

pub(crate) struct ReferenceTable {
    inner: Mutex<TableInner>,
    /// `ADDRESS_SERVER_BIT` when this end of the session is the server.
    side_bit: u64,
    max_pending_oneway: usize,
}

impl ReferenceTable {
    pub fn new(is_server: bool, max_pending_oneway: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next_address: 1,
                ..TableInner::default()
            }),
            side_bit: if is_server { ADDRESS_SERVER_BIT } else { 0 },
            max_pending_oneway,
        }
    }

    fn is_ours(&self, address: u64) -> bool {
        address & ADDRESS_SERVER_BIT == self.side_bit
    }

    /// Number of live entries.
    pub fn count_binders(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Register one outgoing strong reference and return its address.
    ///
    /// The caller has already checked that `binder` may travel on this
    /// session.
    pub fn on_binder_leaving(&self, binder: &SpBinder) -> Result<u64, Status> {
        if let Some(address) = binder.remote_address() {
            // A proxy going back to its owner: the owner resolves it to its
            // local object, strong counts stay as they are.
            self.note_mention(address)?;
            return Ok(address);
        }

        let mut inner = self.inner.lock();
        if inner.terminated {
            return Err(Status::dead_object());
        }
        let key = binder.as_ptr() as usize;
        if let Some(&address) = inner.local_index.get(&key) {
            if let Some(Entry::Local(entry)) = inner.entries.get_mut(&address) {
                entry.times_sent += 1;
                if entry.sent_ref.is_none() {
                    entry.sent_ref = Some(binder.clone());
                }
                tracing::trace!(
                    address = format_args!("{address:#x}"),
                    times_sent = entry.times_sent,
                    "local binder sent again"
                );
                return Ok(address);
            }
        }

        let address = inner.next_address | self.side_bit;
        inner.next_address += 1;
        inner.entries.insert(
            address,
            Entry::Local(LocalEntry {
                object: binder.downgrade_raw(),
                sent_ref: Some(binder.clone()),
                times_sent: 1,
                mentions: 0,
                next_async: 0,
                async_running: false,
                async_todo: BTreeMap::new(),
            }),
        );
        inner.local_index.insert(key, address);
        tracing::debug!(
            address = format_args!("{address:#x}"),
            "new local binder entry"
        );
        Ok(address)
    }

    /// Count one outgoing message naming the remote object at `address`.
    pub fn note_mention(&self, address: u64) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if inner.terminated {
            return Err(Status::dead_object());
        }
        match inner.entries.get_mut(&address) {
            Some(Entry::Remote(entry)) => {
                entry.mentions += 1;
                Ok(())
            }
            _ => Err(Status::with_message(
                StatusCode::BadValue,
                format!("no proxy entry for {address:#x}"),
            )),
        }
    }

    /// Resolve one incoming strong reference.
    pub fn on_binder_entering(&self, session: &RpcSession, address: u64) -> Result<SpBinder, Status> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.terminated {
            return Err(Status::dead_object());
        }
        if address == SPECIAL_ADDRESS {
            return Err(Status::with_message(
                StatusCode::BadValue,
                "reserved address used for an object",
            ));
        }

        match inner.entries.get_mut(&address) {
            Some(Entry::Local(entry)) => {
                let binder = entry.sent_ref.clone().ok_or_else(|| {
                    Status::with_message(
                        StatusCode::BadValue,
                        format!("peer sent back {address:#x} without holding it"),
                    )
                })?;
                entry.mentions += 1;
                let released = Self::settle_local(inner, address);
                drop(guard);
                drop(released);
                Ok(binder)
            }
            Some(Entry::Remote(entry)) => {
                entry.times_recd += 1;
                if let Some(proxy) = entry.proxy.upgrade() {
                    return Ok(SpBinder::from_raw(proxy));
                }
                // The previous proxy is dying; its drop sees that the entry
                // moved on and leaves the count to the new one.
                let proxy = SpBinder::new_remote(session.clone(), address);
                entry.proxy = proxy.downgrade_raw();
                Ok(proxy)
            }
            None => {
                if self.is_ours(address) {
                    return Err(Status::with_message(
                        StatusCode::BadValue,
                        format!("unknown local address {address:#x}"),
                    ));
                }
                let proxy = SpBinder::new_remote(session.clone(), address);
                let next_async = inner.retired_async.remove(&address).unwrap_or(0);
                inner.entries.insert(
                    address,
                    Entry::Remote(RemoteEntry {
                        proxy: proxy.downgrade_raw(),
                        times_recd: 1,
                        weak: 0,
                        mentions: 0,
                        next_async,
                    }),
                );
                tracing::debug!(
                    address = format_args!("{address:#x}"),
                    "new remote binder entry"
                );
                Ok(proxy)
            }
        }
    }

    /// Called from the drop of a proxy. Returns true when a housekeeping
    /// message was queued.
    pub fn on_proxy_dropped(&self, address: u64, proxy: *const BinderObject) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminated {
            return false;
        }
        let Some(Entry::Remote(entry)) = inner.entries.get_mut(&address) else {
            return false;
        };
        if entry.proxy.as_ptr() != proxy {
            return false;
        }
        let amount = std::mem::take(&mut entry.times_recd);
        let mentions = std::mem::take(&mut entry.mentions);
        let erase = entry.weak == 0;
        let next_async = entry.next_async;
        if erase {
            inner.entries.remove(&address);
            if next_async > 0 {
                inner.retired_async.insert(address, next_async);
            }
        }
        let queued = amount > 0;
        if queued {
            inner.outbox.push(Message::DecStrong {
                address,
                amount,
                mentions,
            });
        }
        tracing::debug!(
            address = format_args!("{address:#x}"),
            amount,
            mentions,
            erased = erase,
            "proxy released"
        );
        queued
    }

    pub fn inc_weak(&self, address: u64) {
        let mut inner = self.inner.lock();
        if let Some(Entry::Remote(entry)) = inner.entries.get_mut(&address) {
            entry.weak += 1;
        }
    }

    pub fn dec_weak(&self, address: u64) {
        let mut inner = self.inner.lock();
        let Some(Entry::Remote(entry)) = inner.entries.get_mut(&address) else {
            return;
        };
        entry.weak = entry.weak.saturating_sub(1);
        if entry.weak == 0 && entry.times_recd == 0 {
            let next_async = entry.next_async;
            inner.entries.remove(&address);
            if next_async > 0 {
                inner.retired_async.insert(address, next_async);
            }
        }
    }

    /// Apply a `DecStrong` from the peer.
    ///
    /// An unknown address or an underflow means the two tables disagree,
    /// which is fatal to the session.
    pub fn dec_strong(&self, address: u64, amount: u64, mentions: u64) -> Result<Released, Status> {
        let mut inner = self.inner.lock();
        if inner.terminated {
            return Ok(Released::default());
        }
        let Some(Entry::Local(entry)) = inner.entries.get_mut(&address) else {
            return Err(Status::with_message(
                StatusCode::BadValue,
                format!("dec-strong for unknown local address {address:#x}"),
            ));
        };
        if entry.times_sent < amount {
            return Err(Status::with_message(
                StatusCode::BadValue,
                format!(
                    "dec-strong of {amount} on {address:#x} which was only sent {} times",
                    entry.times_sent
                ),
            ));
        }
        entry.times_sent -= amount;
        entry.mentions = entry.mentions.saturating_sub_unsigned(mentions);
        tracing::debug!(
            address = format_args!("{address:#x}"),
            amount,
            times_sent = entry.times_sent,
            in_flight = -entry.mentions.min(0),
            "dec-strong applied"
        );
        let mut released = Released::default();
        released.binders.extend(Self::settle_local(&mut inner, address));
        Ok(released)
    }

    /// Release the table's reference once the peer holds none and no
    /// mention is in flight, and erase the entry once nothing else needs it.
    fn settle_local(inner: &mut TableInner, address: u64) -> Option<SpBinder> {
        let Some(Entry::Local(entry)) = inner.entries.get_mut(&address) else {
            return None;
        };
        if !entry.is_released() {
            return None;
        }
        let released = entry.sent_ref.take();
        if entry.is_idle() {
            Self::erase_local(inner, address);
        }
        released
    }

    fn erase_local(inner: &mut TableInner, address: u64) {
        if let Some(Entry::Local(entry)) = inner.entries.remove(&address) {
            inner.local_index.remove(&(entry.object.as_ptr() as usize));
        }
    }

    /// Target of an incoming blocking transaction.
    pub fn lookup_local(&self, address: u64) -> Result<SpBinder, Status> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.terminated {
            return Err(Status::dead_object());
        }
        let entry = match inner.entries.get_mut(&address) {
            Some(Entry::Local(entry)) => entry,
            Some(Entry::Remote(_)) => {
                return Err(Status::with_message(
                    StatusCode::InvalidOperation,
                    format!("transaction on {address:#x} which is not a local object"),
                ));
            }
            None => {
                return Err(Status::with_message(
                    StatusCode::BadValue,
                    format!("transaction on unknown address {address:#x}"),
                ));
            }
        };
        let target = entry.sent_ref.clone().ok_or_else(|| {
            Status::with_message(
                StatusCode::BadValue,
                format!("transaction on {address:#x} which the peer no longer holds"),
            )
        })?;
        entry.mentions += 1;
        let released = Self::settle_local(inner, address);
        drop(guard);
        drop(released);
        Ok(target)
    }

    /// Count an outgoing transaction to the proxy at `address`. Oneway
    /// transactions also take the next async number, blocking ones get 0.
    pub fn prepare_transact(&self, address: u64, oneway: bool) -> Result<u64, Status> {
        let mut inner = self.inner.lock();
        if inner.terminated {
            return Err(Status::dead_object());
        }
        match inner.entries.get_mut(&address) {
            Some(Entry::Remote(entry)) => {
                entry.mentions += 1;
                if !oneway {
                    return Ok(0);
                }
                let number = entry.next_async;
                entry.next_async += 1;
                Ok(number)
            }
            _ => Err(Status::with_message(
                StatusCode::BadValue,
                format!("no proxy entry for {address:#x}"),
            )),
        }
    }

    /// Offer an incoming oneway transaction.
    ///
    /// Returns it back when it is this object's turn; otherwise it is queued
    /// and `None` is returned. Any rejection is fatal to the session: the
    /// peer only names objects it holds, and it numbers them without gaps
    /// or repeats. The parcel comes back with the error so the caller drops
    /// it outside the lock.
    pub fn claim_oneway(
        &self,
        address: u64,
        code: u32,
        data: Parcel,
        async_number: u64,
    ) -> Result<Option<PendingOneway>, (Status, Parcel)> {
        let mut inner = self.inner.lock();
        if inner.terminated {
            return Err((Status::dead_object(), data));
        }
        let Some(Entry::Local(entry)) = inner.entries.get_mut(&address) else {
            return Err((
                Status::with_message(
                    StatusCode::BadValue,
                    format!("oneway transaction on unknown address {address:#x}"),
                ),
                data,
            ));
        };
        let Some(target) = entry.sent_ref.clone() else {
            return Err((
                Status::with_message(
                    StatusCode::BadValue,
                    format!("oneway transaction on {address:#x} which the peer no longer holds"),
                ),
                data,
            ));
        };
        let number = async_number;
        if number < entry.next_async
            || (number == entry.next_async && entry.async_running)
            || entry.async_todo.contains_key(&number)
        {
            return Err((
                Status::with_message(
                    StatusCode::BadValue,
                    format!(
                        "duplicate oneway number {number} on {address:#x}, expecting {}",
                        entry.next_async
                    ),
                ),
                data,
            ));
        }
        let pending = PendingOneway {
            target,
            code,
            data,
            async_number,
        };
        if number == entry.next_async {
            entry.mentions += 1;
            entry.async_running = true;
            return Ok(Some(pending));
        }
        if entry.async_todo.len() >= self.max_pending_oneway {
            let max = self.max_pending_oneway;
            drop(inner);
            return Err((
                Status::with_message(
                    StatusCode::NoMemory,
                    format!("more than {max} oneway transactions queued on {address:#x}"),
                ),
                pending.data,
            ));
        }
        entry.mentions += 1;
        tracing::trace!(
            address = format_args!("{address:#x}"),
            number,
            expecting = entry.next_async,
            queued = entry.async_todo.len() + 1,
            "oneway transaction queued"
        );
        entry.async_todo.insert(number, pending);
        Ok(None)
    }

    /// Mark the running oneway transaction on `address` done and hand out
    /// its successor if it already arrived.
    pub fn finish_oneway(&self, address: u64) -> Option<PendingOneway> {
        let mut inner = self.inner.lock();
        let Some(Entry::Local(entry)) = inner.entries.get_mut(&address) else {
            return None;
        };
        entry.next_async += 1;
        if let Some(next) = entry.async_todo.remove(&entry.next_async) {
            return Some(next);
        }
        entry.async_running = false;
        let released = Self::settle_local(&mut inner, address);
        drop(inner);
        drop(released);
        None
    }

    /// Drain queued housekeeping messages.
    pub fn take_outbox(&self) -> Vec<Message> {
        std::mem::take(&mut self.inner.lock().outbox)
    }

    #[cfg(test)]
    pub fn has_outbox(&self) -> bool {
        !self.inner.lock().outbox.is_empty()
    }

    /// Drop every entry. Later operations fail with `DeadObject`.
    pub fn terminate(&self) -> Released {
        let mut inner = self.inner.lock();
        inner.terminated = true;
        inner.local_index.clear();
        inner.outbox.clear();
        inner.retired_async.clear();
        let mut released = Released::default();
        for (_, entry) in inner.entries.drain() {
            if let Entry::Local(entry) = entry {
                released.binders.extend(entry.sent_ref);
                released.pending.extend(entry.async_todo.into_values());
            }
        }
        released
    }

    /// Human-readable listing of all entries.
    pub fn dump(&self) -> String {
        let inner = self.inner.lock();
        let mut addresses: Vec<_> = inner.entries.keys().copied().collect();
        addresses.sort_unstable();
        let mut out = format!("{} entries\n", addresses.len());
        for address in addresses {
            let _ = match &inner.entries[&address] {
                Entry::Local(e) => writeln!(
                    out,
                    "  {address:#018x} local  times_sent={} mentions={} alive={} next_async={} queued={}",
                    e.times_sent,
                    e.mentions,
                    e.object.strong_count() > 0,
                    e.next_async,
                    e.async_todo.len()
                ),
                Entry::Remote(e) => writeln!(
                    out,
                    "  {address:#018x} remote times_recd={} weak={} mentions={} proxy_alive={} next_async={}",
                    e.times_recd,
                    e.weak,
                    e.mentions,
                    e.proxy.strong_count() > 0,
                    e.next_async
                ),
            };
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Binder, CallContext, RpcSession};
    use futures::future::BoxFuture;

    struct Dummy;

    impl Binder for Dummy {
        fn descriptor(&self) -> &str {
            "dummy"
        }

        fn on_transact(
            &self,
            _code: u32,
            _data: Parcel,
            _cx: CallContext,
        ) -> BoxFuture<'static, Result<Parcel, Status>> {
            Box::pin(async { Ok(Parcel::new()) })
        }
    }

    fn claim(
        table: &ReferenceTable,
        address: u64,
        async_number: u64,
    ) -> Result<Option<PendingOneway>, Status> {
        table
            .claim_oneway(address, 1, Parcel::new(), async_number)
            .map_err(|(status, _)| status)
    }

    #[test]
    fn same_local_object_gets_same_address() {
        let table = ReferenceTable::new(true, 16);
        let object = SpBinder::new(Dummy);
        let a = table.on_binder_leaving(&object).unwrap();
        let b = table.on_binder_leaving(&object).unwrap();
        assert_eq!(a, b);
        assert_ne!(a & ADDRESS_SERVER_BIT, 0);
        assert_eq!(table.count_binders(), 1);

        let other = table.on_binder_leaving(&SpBinder::new(Dummy)).unwrap();
        assert_ne!(other, a);
        assert_eq!(table.count_binders(), 2);
    }

    #[test]
    fn dec_strong_releases_and_erases() {
        let table = ReferenceTable::new(false, 16);
        let object = SpBinder::new(Dummy);
        let weak = object.downgrade();
        let address = table.on_binder_leaving(&object).unwrap();
        table.on_binder_leaving(&object).unwrap();
        drop(object);
        assert!(weak.upgrade().is_some(), "table keeps sent objects alive");

        let released = table.dec_strong(address, 1, 0).unwrap();
        assert!(released.is_empty());
        let released = table.dec_strong(address, 1, 0).unwrap();
        assert!(!released.is_empty());
        drop(released);
        assert!(weak.upgrade().is_none());
        assert_eq!(table.count_binders(), 0);
    }

    #[test]
    fn dec_strong_underflow_is_an_error() {
        let table = ReferenceTable::new(false, 16);
        let object = SpBinder::new(Dummy);
        let address = table.on_binder_leaving(&object).unwrap();
        assert_eq!(
            table.dec_strong(address, 2, 0).err().unwrap(),
            StatusCode::BadValue
        );
        assert_eq!(
            table.dec_strong(address + 1, 1, 0).err().unwrap(),
            StatusCode::BadValue
        );
    }

    #[test]
    fn oneway_transactions_run_in_number_order() {
        let table = ReferenceTable::new(false, 16);
        let object = SpBinder::new(Dummy);
        let address = table.on_binder_leaving(&object).unwrap();

        assert!(claim(&table, address, 2).unwrap().is_none());
        assert!(claim(&table, address, 1).unwrap().is_none());
        let first = claim(&table, address, 0).unwrap().unwrap();
        assert_eq!(first.async_number, 0);
        assert_eq!(first.target, object);

        let second = table.finish_oneway(address).unwrap();
        assert_eq!(second.async_number, 1);
        let third = table.finish_oneway(address).unwrap();
        assert_eq!(third.async_number, 2);
        assert!(table.finish_oneway(address).is_none());

        assert!(claim(&table, address, 3).unwrap().is_some());
    }

    #[test]
    fn oneway_duplicates_and_overflow_are_errors() {
        let table = ReferenceTable::new(false, 2);
        let object = SpBinder::new(Dummy);
        let address = table.on_binder_leaving(&object).unwrap();

        assert!(claim(&table, address, 0).unwrap().is_some());
        assert_eq!(claim(&table, address, 0).err().unwrap(), StatusCode::BadValue);

        assert!(claim(&table, address, 1).unwrap().is_none());
        assert!(claim(&table, address, 2).unwrap().is_none());
        assert_eq!(claim(&table, address, 3).err().unwrap(), StatusCode::NoMemory);
    }

    #[test]
    fn entry_survives_release_while_oneway_runs() {
        let table = ReferenceTable::new(false, 16);
        let object = SpBinder::new(Dummy);
        let address = table.on_binder_leaving(&object).unwrap();
        let running = claim(&table, address, 0).unwrap();
        drop(table.dec_strong(address, 1, 1).unwrap());
        assert_eq!(table.count_binders(), 1);
        drop(running);
        assert!(table.finish_oneway(address).is_none());
        assert_eq!(table.count_binders(), 0);
    }

    #[test]
    fn release_waits_for_mentions_in_flight() {
        let table = ReferenceTable::new(false, 16);
        let object = SpBinder::new(Dummy);
        let weak = object.downgrade();
        let address = table.on_binder_leaving(&object).unwrap();
        drop(object);

        // The peer sent the object back once, then dropped its proxy, and
        // the release overtook the message carrying it.
        drop(table.dec_strong(address, 1, 1).unwrap());
        assert_eq!(table.count_binders(), 1);
        assert!(weak.upgrade().is_some());

        let session = RpcSession::new();
        let returned = table.on_binder_entering(&session, address).unwrap();
        assert_eq!(table.count_binders(), 0);
        assert!(returned.is_local());
        drop(returned);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn terminate_releases_everything() {
        let table = ReferenceTable::new(false, 16);
        let object = SpBinder::new(Dummy);
        let weak = object.downgrade();
        let address = table.on_binder_leaving(&object).unwrap();
        drop(object);
        let released = table.terminate();
        drop(released);
        assert!(weak.upgrade().is_none());
        assert_eq!(table.count_binders(), 0);
        assert_eq!(
            table.lookup_local(address).unwrap_err(),
            StatusCode::DeadObject
        );
    }

    #[test]
    fn remote_entries_cache_proxies_and_queue_releases() {
        let session = RpcSession::new();
        let table = session.table();
        let address = ADDRESS_SERVER_BIT | 5;

        let a = table.on_binder_entering(&session, address).unwrap();
        let b = table.on_binder_entering(&session, address).unwrap();
        assert_eq!(a, b);
        assert!(a.is_remote());
        assert_eq!(table.count_binders(), 1);

        drop(a);
        assert!(!table.has_outbox());
        drop(b);
        assert_eq!(
            table.take_outbox(),
            vec![Message::DecStrong {
                address,
                amount: 2,
                mentions: 0,
            }]
        );
        assert_eq!(table.count_binders(), 0);
    }

    #[test]
    fn weak_proxy_keeps_entry_but_cannot_promote() {
        let session = RpcSession::new();
        let table = session.table();
        let address = ADDRESS_SERVER_BIT | 9;

        let proxy = table.on_binder_entering(&session, address).unwrap();
        let weak = proxy.downgrade();
        drop(proxy);
        assert_eq!(table.count_binders(), 1);
        assert!(weak.upgrade().is_none());
        drop(weak);
        assert_eq!(table.count_binders(), 0);
    }

    #[test]
    fn unknown_address_claiming_to_be_ours_is_rejected() {
        let session = RpcSession::new();
        let err = session.table().on_binder_entering(&session, 3).unwrap_err();
        assert_eq!(err, StatusCode::BadValue);
    }

    #[test]
    fn retired_async_counter_is_restored() {
        let session = RpcSession::new();
        let table = session.table();
        let address = ADDRESS_SERVER_BIT | 2;
        let proxy = table.on_binder_entering(&session, address).unwrap();
        assert_eq!(table.prepare_transact(address, true).unwrap(), 0);
        assert_eq!(table.prepare_transact(address, false).unwrap(), 0);
        assert_eq!(table.prepare_transact(address, true).unwrap(), 1);
        drop(proxy);
        assert_eq!(
            table.take_outbox(),
            vec![Message::DecStrong {
                address,
                amount: 1,
                mentions: 3,
            }]
        );
        let _proxy = table.on_binder_entering(&session, address).unwrap();
        assert_eq!(table.prepare_transact(address, true).unwrap(), 2);
    }
}
