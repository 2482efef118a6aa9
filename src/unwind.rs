use std::io;
use std::io::prelude::*;
use std::process;

/// A panic that escapes a fiber body would try to unwind across a context
/// switch, which the runtime cannot express; anything that drops this guard
/// during unwinding takes the whole process down instead.
pub(crate) struct AbortIfPanic;

impl Drop for AbortIfPanic {
    fn drop(&mut self) {
        let _ = writeln!(
            &mut io::stderr(),
            "detected unexpected panic in the scheduler; aborting"
        );
        process::abort();
    }
}
