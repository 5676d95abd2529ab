//! Class instance registry
//!
//! Instances live in an arena of slots addressed by generational
//! [`ClassHandle`]s. Each slot carries two independent intrusive links: `next`
//! threads the main chain (attach order, used for broadcast and first-match
//! dispatch) and `sof_next` threads the SOF subscriber chain. Leaving one
//! chain never disturbs the other, and a stale handle can never alias a
//! reused slot because the generation changes on every release.
//!
//! The stack-level append/remove algorithms are implemented on `Core` at the
//! bottom of this module.

use crate::class::{Claims, UsbClass};
use crate::error::{Error, Result};
use crate::event::{Event, Outcome};
use crate::stack::Core;
use crate::state::DeviceState;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Stable identity of an appended class instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassHandle {
    index: u16,
    generation: u32,
}

impl ClassHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ClassHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Main,
    Sof,
}

struct Entry {
    /// `None` while the instance's own handler is executing
    class: Option<Box<dyn UsbClass>>,
    claims: Claims,
    linked: bool,
    next: Option<usize>,
    in_sof: bool,
    sof_next: Option<usize>,
}

impl Entry {
    fn next(&self, link: Link) -> Option<usize> {
        match link {
            Link::Main => self.next,
            Link::Sof => self.sof_next,
        }
    }

    fn set_next(&mut self, link: Link, next: Option<usize>) {
        match link {
            Link::Main => self.next = next,
            Link::Sof => self.sof_next = next,
        }
    }

    fn is_linked(&self, link: Link) -> bool {
        match link {
            Link::Main => self.linked,
            Link::Sof => self.in_sof,
        }
    }

    fn set_linked(&mut self, link: Link, linked: bool) {
        match link {
            Link::Main => self.linked = linked,
            Link::Sof => self.in_sof = linked,
        }
    }
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Chain {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Default)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    main: Chain,
    sof: Chain,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, handle: ClassHandle) -> Option<usize> {
        let slot = self.slots.get(handle.index())?;
        (slot.generation == handle.generation && slot.entry.is_some()).then_some(handle.index())
    }

    fn entry(&self, index: usize) -> Option<&Entry> {
        self.slots.get(index)?.entry.as_ref()
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut Entry> {
        self.slots.get_mut(index)?.entry.as_mut()
    }

    fn handle_at(&self, index: usize) -> Option<ClassHandle> {
        let slot = self.slots.get(index)?;
        slot.entry.as_ref()?;
        Some(ClassHandle {
            index: index as u16,
            generation: slot.generation,
        })
    }

    fn chain(&self, link: Link) -> &Chain {
        match link {
            Link::Main => &self.main,
            Link::Sof => &self.sof,
        }
    }

    fn chain_mut(&mut self, link: Link) -> &mut Chain {
        match link {
            Link::Main => &mut self.main,
            Link::Sof => &mut self.sof,
        }
    }

    /// Allocate a slot for an instance; it is not linked into any chain yet
    pub(crate) fn insert(&mut self, class: Box<dyn UsbClass>, claims: Claims) -> Result<ClassHandle> {
        let entry = Entry {
            class: Some(class),
            claims,
            linked: false,
            next: None,
            in_sof: false,
            sof_next: None,
        };

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() > u16::MAX as usize {
                    return Err(Error::Internal("class arena exhausted".into()));
                }
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.entry = Some(entry);
        Ok(ClassHandle {
            index: index as u16,
            generation: slot.generation,
        })
    }

    /// Free a slot, handing the instance back; it must be out of both chains
    pub(crate) fn release(&mut self, handle: ClassHandle) -> Result<Box<dyn UsbClass>> {
        let index = self.resolve(handle).ok_or(Error::NotFound)?;
        let slot = &mut self.slots[index];
        if let Some(entry) = slot.entry.as_ref()
            && (entry.linked || entry.in_sof)
        {
            return Err(Error::Internal(format!("{handle} released while still chained")));
        }

        let entry = slot.entry.take().ok_or(Error::NotFound)?;
        // A slot whose generation is used up is retired, never reused
        match slot.generation.checked_add(1) {
            Some(generation) => {
                slot.generation = generation;
                self.free.push(index);
            }
            None => warn!(%handle, "slot generations exhausted, retiring slot"),
        }

        entry
            .class
            .ok_or_else(|| Error::Internal(format!("{handle} released while executing")))
    }

    fn link_tail(&mut self, handle: ClassHandle, link: Link) -> Result<()> {
        let index = self.resolve(handle).ok_or(Error::NotFound)?;
        let tail = self.chain(link).tail;

        let entry = self.entry_mut(index).ok_or(Error::NotFound)?;
        if entry.is_linked(link) {
            return Err(Error::AlreadyAssigned);
        }
        entry.set_linked(link, true);
        entry.set_next(link, None);

        match tail {
            Some(tail) => self
                .entry_mut(tail)
                .ok_or_else(|| Error::Internal("chain tail points to a free slot".into()))?
                .set_next(link, Some(index)),
            None => self.chain_mut(link).head = Some(index),
        }

        let chain = self.chain_mut(link);
        chain.tail = Some(index);
        chain.len += 1;
        Ok(())
    }

    fn unlink(&mut self, handle: ClassHandle, link: Link) -> Result<()> {
        let index = self.resolve(handle).ok_or(Error::NotFound)?;
        if !self.entry(index).is_some_and(|e| e.is_linked(link)) {
            return Err(Error::NotFound);
        }

        let mut prev = None;
        let mut cursor = self.chain(link).head;
        while let Some(current) = cursor {
            if current == index {
                break;
            }
            prev = Some(current);
            cursor = self.entry(current).and_then(|e| e.next(link));
        }
        if cursor.is_none() {
            return Err(Error::Internal(format!(
                "{handle} marked as linked but unreachable from the {link:?} chain head"
            )));
        }

        let next = self.entry(index).and_then(|e| e.next(link));
        match prev {
            Some(prev) => {
                if let Some(entry) = self.entry_mut(prev) {
                    entry.set_next(link, next);
                }
            }
            None => self.chain_mut(link).head = next,
        }

        let chain = self.chain_mut(link);
        if chain.tail == Some(index) {
            chain.tail = prev;
        }
        chain.len -= 1;

        if let Some(entry) = self.entry_mut(index) {
            entry.set_linked(link, false);
            entry.set_next(link, None);
        }
        Ok(())
    }

    pub(crate) fn link(&mut self, handle: ClassHandle) -> Result<()> {
        self.link_tail(handle, Link::Main)
    }

    pub(crate) fn unlink_main(&mut self, handle: ClassHandle) -> Result<()> {
        self.unlink(handle, Link::Main)
    }

    pub(crate) fn sof_link(&mut self, handle: ClassHandle) -> Result<()> {
        self.link_tail(handle, Link::Sof)
    }

    pub(crate) fn sof_unlink(&mut self, handle: ClassHandle) -> Result<()> {
        self.unlink(handle, Link::Sof)
    }

    /// Slot allocated and handle current (chained or mid-removal)
    pub(crate) fn is_live(&self, handle: ClassHandle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Member of the main chain
    pub(crate) fn contains(&self, handle: ClassHandle) -> bool {
        self.resolve(handle)
            .and_then(|i| self.entry(i))
            .is_some_and(|e| e.linked)
    }

    pub(crate) fn in_sof(&self, handle: ClassHandle) -> bool {
        self.resolve(handle)
            .and_then(|i| self.entry(i))
            .is_some_and(|e| e.in_sof)
    }

    /// The instance's handler is currently running
    pub(crate) fn is_busy(&self, handle: ClassHandle) -> bool {
        self.resolve(handle)
            .and_then(|i| self.entry(i))
            .is_some_and(|e| e.class.is_none())
    }

    pub(crate) fn len(&self) -> usize {
        self.main.len
    }

    pub(crate) fn sof_len(&self) -> usize {
        self.sof.len
    }

    pub(crate) fn head(&self) -> Option<ClassHandle> {
        self.main.head.and_then(|i| self.handle_at(i))
    }

    pub(crate) fn next(&self, handle: ClassHandle) -> Option<ClassHandle> {
        let index = self.resolve(handle)?;
        self.entry(index)?.next.and_then(|i| self.handle_at(i))
    }

    pub(crate) fn sof_head(&self) -> Option<ClassHandle> {
        self.sof.head.and_then(|i| self.handle_at(i))
    }

    pub(crate) fn sof_next(&self, handle: ClassHandle) -> Option<ClassHandle> {
        let index = self.resolve(handle)?;
        self.entry(index)?.sof_next.and_then(|i| self.handle_at(i))
    }

    /// Main chain handles in attach order
    pub(crate) fn iter(&self) -> impl Iterator<Item = ClassHandle> + '_ {
        std::iter::successors(self.head(), |h| self.next(*h))
    }

    pub(crate) fn sof_iter(&self) -> impl Iterator<Item = ClassHandle> + '_ {
        std::iter::successors(self.sof_head(), |h| self.sof_next(*h))
    }

    pub(crate) fn claims(&self, handle: ClassHandle) -> Option<&Claims> {
        self.resolve(handle)
            .and_then(|i| self.entry(i))
            .map(|e| &e.claims)
    }

    pub(crate) fn class_ref(&self, handle: ClassHandle) -> Option<&dyn UsbClass> {
        self.resolve(handle)
            .and_then(|i| self.entry(i))
            .and_then(|e| e.class.as_deref())
    }

    pub(crate) fn class_mut(&mut self, handle: ClassHandle) -> Option<&mut dyn UsbClass> {
        let index = self.resolve(handle)?;
        self.entry_mut(index)?.class.as_deref_mut()
    }

    /// Move the instance out of its slot for the duration of a callback
    pub(crate) fn take_class(&mut self, handle: ClassHandle) -> Option<Box<dyn UsbClass>> {
        let index = self.resolve(handle)?;
        self.entry_mut(index)?.class.take()
    }

    pub(crate) fn restore_class(&mut self, handle: ClassHandle, class: Box<dyn UsbClass>) {
        match self.resolve(handle).and_then(|i| self.entry_mut(i)) {
            Some(entry) => entry.class = Some(class),
            None => error!(%handle, "instance slot vanished while its handler was running"),
        }
    }
}

impl Core {
    /// Attach an instance at the chain tail and claim its interfaces/endpoints
    pub(crate) fn append(&mut self, class: Box<dyn UsbClass>) -> Result<ClassHandle> {
        self.check_healthy()?;
        self.state.require("append", DeviceState::Disabled)?;

        let claims = class.claims()?;
        let name = class.name().to_owned();
        let handle = self.registry.insert(class, claims.clone())?;

        if let Err(e) = self.claim_all(handle, &claims) {
            // The slot was never linked; dropping it leaves no trace
            let _ = self.registry.release(handle);
            debug!(class = %name, error = %e, "append rejected");
            return Err(e);
        }

        if let Err(e) = self.registry.link(handle) {
            self.table.release_owner(handle);
            let _ = self.registry.release(handle);
            return Err(e);
        }

        info!(%handle, class = %name, interfaces = ?claims.interfaces, endpoints = claims.endpoints.len(), "class instance appended");

        if let Outcome::Failed(e) = self.invoke(handle, &Event::InstanceAppended, None) {
            warn!(%handle, error = %e, "instance refused its append notification, detaching");
            self.detach(handle)?;
            return Err(e);
        }
        Ok(handle)
    }

    /// Claim every interface then every endpoint, undoing all on first conflict
    fn claim_all(&mut self, handle: ClassHandle, claims: &Claims) -> Result<()> {
        let mut claimed_ifaces = Vec::with_capacity(claims.interfaces.len());
        let mut claimed_eps = Vec::with_capacity(claims.endpoints.len());

        let result = (|| -> Result<()> {
            for &iface in &claims.interfaces {
                self.table.claim_interface(iface, handle)?;
                claimed_ifaces.push(iface);
            }
            for &ep in &claims.endpoints {
                self.table.claim_endpoint(ep, handle)?;
                claimed_eps.push(ep);
            }
            Ok(())
        })();

        if result.is_err() {
            for iface in claimed_ifaces {
                self.table.release_interface(iface);
            }
            for ep in claimed_eps {
                self.table.release_endpoint(ep);
            }
        }
        result
    }

    /// Detach an instance from the main chain and hand it back
    pub(crate) fn remove(&mut self, handle: ClassHandle) -> Result<Box<dyn UsbClass>> {
        self.check_healthy()?;
        self.state.require("remove", DeviceState::Disabled)?;
        if !self.registry.contains(handle) {
            return Err(Error::NotFound);
        }
        self.detach(handle)
    }

    fn detach(&mut self, handle: ClassHandle) -> Result<Box<dyn UsbClass>> {
        let released = self.table.release_owner(handle);
        if self.registry.contains(handle) {
            self.registry.unlink_main(handle)?;
        }

        // The instance unregisters itself from SOF/RWU while reacting
        if let Outcome::Failed(e) = self.invoke(handle, &Event::InstanceRemoved, None) {
            warn!(%handle, error = %e, "instance reported failure while being removed");
        }

        if self.registry.in_sof(handle) {
            warn!(%handle, "instance left the SOF chain registered on removal, unlinking");
            self.registry.sof_unlink(handle)?;
            self.update_sof_enable();
        }

        let class = self.registry.release(handle)?;
        info!(%handle, bindings = released, "class instance removed");
        Ok(class)
    }

    /// Remove instances from the chain head until it is empty
    ///
    /// Any failure during the sweep means the chain is corrupt: the stack is
    /// marked faulted and the error is reported as [`Error::Internal`].
    pub(crate) fn remove_all(&mut self) -> Result<Vec<Box<dyn UsbClass>>> {
        self.check_healthy()?;
        self.state.require("remove_all", DeviceState::Disabled)?;

        let mut removed = Vec::with_capacity(self.registry.len());
        while let Some(handle) = self.registry.head() {
            match self.remove(handle) {
                Ok(class) => removed.push(class),
                Err(e) => {
                    let reason = format!("remove_all failed on {handle}: {e}");
                    error!("{reason}");
                    self.fault(reason.clone());
                    return Err(Error::Internal(reason));
                }
            }
        }

        if self.registry.len() != 0 {
            let reason = format!("chain length {} after remove_all", self.registry.len());
            self.fault(reason.clone());
            return Err(Error::Internal(reason));
        }
        Ok(removed)
    }

    pub(crate) fn find_descriptor(
        &self,
        handle: ClassHandle,
        descriptor_type: u8,
        index: u8,
    ) -> Result<Option<&[u8]>> {
        if !self.registry.is_live(handle) {
            return Err(Error::NotFound);
        }
        let class = self.registry.class_ref(handle).ok_or(Error::InvalidState {
            op: "find_descriptor (instance busy)",
            state: self.state.state(),
        })?;
        Ok(class.find_descriptor(descriptor_type, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassContext;

    struct Dummy(u8);

    impl UsbClass for Dummy {
        fn descriptors(&self) -> &[u8] {
            &[]
        }

        fn event(&mut self, _ctx: &mut ClassContext<'_>, _event: &Event) -> Outcome {
            Outcome::Declined
        }
    }

    fn insert_linked(reg: &mut Registry, tag: u8) -> ClassHandle {
        let h = reg.insert(Box::new(Dummy(tag)), Claims::default()).unwrap();
        reg.link(h).unwrap();
        h
    }

    #[test]
    fn test_main_chain_preserves_attach_order() {
        let mut reg = Registry::new();
        let a = insert_linked(&mut reg, 1);
        let b = insert_linked(&mut reg, 2);
        let c = insert_linked(&mut reg, 3);

        assert_eq!(reg.iter().collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(reg.len(), 3);

        reg.unlink_main(b).unwrap();
        assert_eq!(reg.iter().collect::<Vec<_>>(), vec![a, c]);

        reg.unlink_main(c).unwrap();
        let d = insert_linked(&mut reg, 4);
        assert_eq!(reg.iter().collect::<Vec<_>>(), vec![a, d]);
    }

    #[test]
    fn test_unlink_absent_is_not_found() {
        let mut reg = Registry::new();
        let a = insert_linked(&mut reg, 1);
        reg.unlink_main(a).unwrap();
        assert_eq!(reg.unlink_main(a), Err(Error::NotFound));
        assert_eq!(reg.sof_unlink(a), Err(Error::NotFound));
    }

    #[test]
    fn test_sof_chain_is_independent() {
        let mut reg = Registry::new();
        let a = insert_linked(&mut reg, 1);
        let b = insert_linked(&mut reg, 2);
        let c = insert_linked(&mut reg, 3);

        reg.sof_link(c).unwrap();
        reg.sof_link(a).unwrap();
        assert_eq!(reg.sof_link(a), Err(Error::AlreadyAssigned));
        assert_eq!(reg.sof_iter().collect::<Vec<_>>(), vec![c, a]);

        // Leaving the main chain does not touch SOF membership
        reg.unlink_main(a).unwrap();
        assert!(reg.in_sof(a));
        assert_eq!(reg.iter().collect::<Vec<_>>(), vec![b, c]);

        reg.sof_unlink(a).unwrap();
        assert_eq!(reg.sof_iter().collect::<Vec<_>>(), vec![c]);
        assert_eq!(reg.sof_len(), 1);
    }

    #[test]
    fn test_released_handle_goes_stale() {
        let mut reg = Registry::new();
        let a = insert_linked(&mut reg, 1);

        // Still chained
        assert!(matches!(reg.release(a), Err(Error::Internal(_))));

        reg.unlink_main(a).unwrap();
        let class = reg.release(a).unwrap();
        assert!(crate::class::downcast_ref::<Dummy>(class.as_ref()).is_some_and(|d| d.0 == 1));

        let b = insert_linked(&mut reg, 2);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(!reg.is_live(a));
        assert!(reg.contains(b));
    }

    fn cycle(reg: &mut Registry) -> ClassHandle {
        let h = insert_linked(reg, 0);
        reg.unlink_main(h).unwrap();
        reg.release(h).unwrap();
        h
    }

    #[test]
    fn test_stale_handle_survives_many_slot_reuses() {
        let mut reg = Registry::new();
        let stale = cycle(&mut reg);

        for _ in 0..=u16::MAX as usize {
            cycle(&mut reg);
        }

        let live = insert_linked(&mut reg, 9);
        assert_eq!(live.index(), stale.index());
        assert_ne!(live, stale);
        assert!(!reg.is_live(stale));
        assert!(reg.class_ref(stale).is_none());
        assert_eq!(reg.unlink_main(stale), Err(Error::NotFound));
        assert!(reg.contains(live));
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let mut reg = Registry::new();
        let a = insert_linked(&mut reg, 1);
        reg.slots[a.index()].generation = u32::MAX;
        let last = reg.handle_at(a.index()).unwrap();

        reg.unlink_main(last).unwrap();
        reg.release(last).unwrap();

        let b = insert_linked(&mut reg, 2);
        assert_ne!(b.index(), last.index());
        assert!(!reg.is_live(last));
    }

    #[test]
    fn test_take_and_restore_marks_busy() {
        let mut reg = Registry::new();
        let a = insert_linked(&mut reg, 1);

        let class = reg.take_class(a).unwrap();
        assert!(reg.is_busy(a));
        assert!(reg.class_ref(a).is_none());

        reg.restore_class(a, class);
        assert!(!reg.is_busy(a));
        assert!(reg.class_ref(a).is_some());
    }
}
