//! One-time class initialisation hooks

use super::OpaqueKind;
use crate::context::Context;
use crate::error::{HostError, VmResult};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Hook run once for every new VM state, e.g. to install constructors into its globals
pub type ClassInit = fn(&Context) -> VmResult<()>;

static CLASSES: Lazy<Mutex<Vec<(OpaqueKind, ClassInit)>>> = Lazy::new(|| {
    Mutex::new(vec![(
        OpaqueKind::SharedTable,
        crate::table::install_shared_table_class as ClassInit,
    )])
});

/// Register an initialisation hook for `kind`
///
/// Hooks run in registration order when a state is created; states created earlier are not
/// affected.
pub fn register_class(kind: OpaqueKind, init: ClassInit) {
    CLASSES.lock().push((kind, init));
    tracing::debug!(kind = %kind, "registered opaque class");
}

pub(crate) fn initialize_classes(ctx: &Context) -> Result<(), HostError> {
    let classes = CLASSES.lock().clone();
    for (kind, init) in classes {
        init(ctx).map_err(|source| HostError::ClassInit { kind, source })?;
    }
    Ok(())
}
