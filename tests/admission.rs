//! Admission through the public surface only.

use loadshed::cpu::FixedCpu;
use loadshed::{Config, Shedder};

#[test]
fn idle_host_admits_a_burst() {
    let shedder = Shedder::with_cpu_monitor(Config::default(), Box::new(FixedCpu(0)))
        .expect("default config is valid");

    for _ in 0..1_000 {
        let permit = shedder.allow().expect("idle host never sheds");
        permit.pass();
    }
}

#[test]
fn clones_share_one_engine() {
    let shedder = Shedder::with_cpu_monitor(Config::default(), Box::new(FixedCpu(0)))
        .expect("default config is valid");

    let mut handles = Vec::new();
    for _ in 0..4 {
        let shedder = shedder.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..250 {
                let permit = shedder.allow().expect("idle host never sheds");
                permit.pass();
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }
}
