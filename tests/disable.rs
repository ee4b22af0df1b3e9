//! Process-global kill switch behavior.
//!
//! This lives in its own integration test binary: flipping the global flag
//! here cannot leak into any other test process.

use loadshed::{Config, Shedder};

#[test]
fn disable_is_idempotent_and_construction_turns_inert() {
    loadshed::disable();
    loadshed::disable();

    let shedder = Shedder::new(Config::default()).expect("construction");
    assert!(matches!(shedder, Shedder::AllIn));

    // An inert shedder admits unconditionally and its permits are no-ops.
    for i in 0..100 {
        let permit = shedder.allow().expect("inert shedder always admits");
        if i % 2 == 0 {
            permit.pass();
        } else {
            permit.fail();
        }
    }

    // Every construction after the switch flips stays inert.
    let shedder = Shedder::new(Config::default()).expect("construction");
    assert!(matches!(shedder, Shedder::AllIn));
}
