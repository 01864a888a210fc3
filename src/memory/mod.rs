pub(crate) mod overflow;
pub(crate) mod page;
pub(crate) mod page_allocator;
pub(crate) mod page_arena;
pub(crate) mod page_stack;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(all(test, not(loom)))]
pub(crate) mod test_support;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
