//! Smallest useful scheduler exercise: dispatch a coroutine that parks
//! itself waiting for data, then wake it by id.

use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use torque_runtime::common::global_data;
use torque_runtime::croutine::{self, CRoutine};
use torque_runtime::scheduler::SchedulerClassic;

fn main() {
    env_logger::init();

    let scheduler = SchedulerClassic::instance();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let monitor = Arc::new(CRoutine::new(move || {
        log::info!("monitor started");
        croutine::hang_up();
        log::info!("monitor finished");
        flag.store(true, Ordering::SeqCst);
    }));
    let crid = global_data::register_task_name("sched_monitor");
    monitor.set_id(crid);
    monitor.set_name("sched_monitor");

    if !scheduler.dispatch_task(monitor) {
        log::error!("dispatch failed");
        exit(1);
    }

    thread::sleep(Duration::from_millis(50));
    if !scheduler.notify_processor(crid) {
        log::error!("notify failed");
        exit(1);
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while !finished.load(Ordering::SeqCst) {
        if Instant::now() > deadline {
            log::error!("monitor never finished");
            exit(1);
        }
        thread::sleep(Duration::from_millis(1));
    }

    scheduler.shutdown();
    println!("hello-sched: ok");
}
