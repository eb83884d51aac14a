//! Task graph semantics: user events, barriers, ordering, idempotence.

mod common;

use common::*;

use rocl::{
    enqueue_barrier, enqueue_marker, set_user_event_status, ArgValue, CommandQueue, Kernel,
    MemFlags, ProfilingInfo, QueueProperties, Resource, Task,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const IOTA_SRC: &str = r#"
kernel void iota(global int* out) {
    out[get_global_id(0)] = get_global_id(0);
}
"#;

fn iota_launch(h: &Harness, wait_list: &[rocl::Event<rocl_backend_null::Backend>]) -> rocl::Event<rocl_backend_null::Backend> {
    let program = build_program(h, IOTA_SRC);
    let kernel = Kernel::create(&program, "iota").unwrap();
    let out = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 64, None).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(Some(out))).unwrap();
    rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[16], None, wait_list).unwrap()
}

#[test]
fn user_event_gates_dependent_chain() {
    let h = harness();
    let user = Task::new_user_event(&h.context);

    let k1 = iota_launch(&h, std::slice::from_ref(&user));
    let k2 = iota_launch(&h, std::slice::from_ref(&k1));

    {
        let lock = h.platform.task_pool_lock();
        h.queue.flush(&lock, true).unwrap();
    }

    // Blocked behind the user event: still submitted.
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(k1.status_code(), 2);
    assert_eq!(k2.status_code(), 2);

    set_user_event_status(&user, 0).unwrap();
    rocl::wait_for_events(&[k1.clone(), k2.clone()]).unwrap();
    assert_eq!(k1.status_code(), 0);
    assert_eq!(k2.status_code(), 0);
}

#[test]
fn user_event_error_propagates_through_dependents() {
    let h = harness();
    let user = Task::new_user_event(&h.context);

    let k1 = iota_launch(&h, std::slice::from_ref(&user));
    let k2 = iota_launch(&h, std::slice::from_ref(&k1));

    {
        let lock = h.platform.task_pool_lock();
        h.queue.flush(&lock, true).unwrap();
    }

    set_user_event_status(&user, -1).unwrap();
    assert_eq!(user.wait_for_completion(), -1);
    assert_eq!(
        k1.wait_for_completion(),
        rocl::error::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST
    );
    assert_eq!(
        k2.wait_for_completion(),
        rocl::error::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST
    );
}

#[test]
fn user_event_status_can_only_be_set_once() {
    let h = harness();
    let user = Task::new_user_event(&h.context);
    set_user_event_status(&user, 0).unwrap();
    let err = set_user_event_status(&user, -1).unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_OPERATION);
}

#[test]
fn out_of_order_queue_barrier_orders_around_it() {
    let h = harness_with(
        vec![rocl_backend_null::AdapterOptions::default()],
        None,
        QueueProperties::OUT_OF_ORDER,
    );

    // Gate k1 and k2 behind user events resolved out of order; the
    // barrier must still hold k3 until both are complete.
    let u1 = Task::new_user_event(&h.context);
    let u2 = Task::new_user_event(&h.context);
    let k1 = iota_launch(&h, std::slice::from_ref(&u1));
    let k2 = iota_launch(&h, std::slice::from_ref(&u2));
    let barrier = enqueue_barrier(&h.queue, &[]).unwrap();
    let k3 = iota_launch(&h, &[]);

    {
        let lock = h.platform.task_pool_lock();
        h.queue.flush(&lock, true).unwrap();
    }

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(k3.status_code(), 2, "k3 must wait behind the barrier");

    set_user_event_status(&u2, 0).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(k3.status_code(), 2, "one gate open is not enough");
    assert_eq!(k2.wait_for_completion(), 0);

    set_user_event_status(&u1, 0).unwrap();
    rocl::wait_for_events(&[k1, barrier.clone(), k3.clone()]).unwrap();
    assert_eq!(barrier.status_code(), 0);
    assert_eq!(k3.status_code(), 0);
}

#[test]
fn in_order_queue_runs_tasks_in_sequence() {
    let h = harness_with(
        vec![rocl_backend_null::AdapterOptions::default()],
        None,
        QueueProperties::PROFILING,
    );
    let events: Vec<_> = (0..4).map(|_| iota_launch(&h, &[])).collect();
    CommandQueue::finish(&h.queue).unwrap();

    let mut previous_start = 0;
    for event in &events {
        let start = event.profiling_info(ProfilingInfo::Start).unwrap();
        let end = event.profiling_info(ProfilingInfo::End).unwrap();
        assert!(start >= previous_start, "in-order start times must ascend");
        assert!(end >= start);
        previous_start = start;
    }
}

#[test]
fn profiling_reports_queued_and_submit_times() {
    let h = harness_with(
        vec![rocl_backend_null::AdapterOptions::default()],
        None,
        QueueProperties::PROFILING,
    );
    let event = iota_launch(&h, &[]);
    CommandQueue::finish(&h.queue).unwrap();

    let queued = event.profiling_info(ProfilingInfo::Queued).unwrap();
    let submit = event.profiling_info(ProfilingInfo::Submit).unwrap();
    assert!(queued > 0);
    assert!(submit >= queued);
}

#[test]
fn profiling_unavailable_without_the_property() {
    let h = harness();
    let event = iota_launch(&h, &[]);
    CommandQueue::finish(&h.queue).unwrap();
    let err = event.profiling_info(ProfilingInfo::Start).unwrap_err();
    assert_eq!(err.code, rocl::error::PROFILING_INFO_NOT_AVAILABLE);
}

#[test]
fn flush_of_an_empty_queue_is_a_no_op() {
    let h = harness();
    let lock = h.platform.task_pool_lock();
    h.queue.flush(&lock, true).unwrap();
    h.queue.flush(&lock, true).unwrap();
    assert_eq!(h.queue.queued_len(), 0);
}

#[test]
fn double_barrier_behaves_like_one() {
    let h = harness();
    let user = Task::new_user_event(&h.context);
    let k1 = iota_launch(&h, std::slice::from_ref(&user));
    let b1 = enqueue_barrier(&h.queue, &[]).unwrap();
    let b2 = enqueue_barrier(&h.queue, &[]).unwrap();
    let k2 = iota_launch(&h, &[]);

    {
        let lock = h.platform.task_pool_lock();
        h.queue.flush(&lock, true).unwrap();
    }
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(k2.status_code(), 2);

    set_user_event_status(&user, 0).unwrap();
    rocl::wait_for_events(&[k1, b1, b2, k2.clone()]).unwrap();
    assert_eq!(k2.status_code(), 0);
}

#[test]
fn marker_with_empty_wait_list_tracks_all_queued_work() {
    let h = harness();
    let user = Task::new_user_event(&h.context);
    let k1 = iota_launch(&h, std::slice::from_ref(&user));
    let marker = enqueue_marker(&h.queue, &[]).unwrap();

    {
        let lock = h.platform.task_pool_lock();
        h.queue.flush(&lock, true).unwrap();
    }
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(marker.status_code(), 2);

    set_user_event_status(&user, 0).unwrap();
    rocl::wait_for_events(&[k1, marker.clone()]).unwrap();
    assert_eq!(marker.status_code(), 0);
}

#[test]
fn callbacks_fire_in_state_order() {
    let h = harness();
    let order = Arc::new(AtomicUsize::new(0));
    let event = iota_launch(&h, &[]);

    let submitted_seen = Arc::new(AtomicUsize::new(0));
    let running_seen = Arc::new(AtomicUsize::new(0));
    let complete_seen = Arc::new(AtomicUsize::new(0));

    {
        let order = Arc::clone(&order);
        let seen = Arc::clone(&submitted_seen);
        event
            .set_callback(2, move |_status| {
                seen.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
            })
            .unwrap();
    }
    {
        let order = Arc::clone(&order);
        let seen = Arc::clone(&running_seen);
        event
            .set_callback(1, move |_status| {
                seen.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
            })
            .unwrap();
    }
    {
        let order = Arc::clone(&order);
        let seen = Arc::clone(&complete_seen);
        event
            .set_callback(0, move |status| {
                assert_eq!(status, 0);
                seen.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
            })
            .unwrap();
    }

    CommandQueue::finish(&h.queue).unwrap();
    // Callbacks run on the callback worker; give it a beat.
    std::thread::sleep(Duration::from_millis(50));

    let submitted = submitted_seen.load(Ordering::SeqCst);
    let running = running_seen.load(Ordering::SeqCst);
    let complete = complete_seen.load(Ordering::SeqCst);
    assert!(submitted >= 1 && running >= 1 && complete >= 1, "all fired");
    assert!(submitted < running && running < complete, "state order");
}

#[test]
fn wait_lists_must_share_the_context() {
    let h = harness();
    let other = harness();
    let foreign = Task::new_user_event(&other.context);
    let program = build_program(&h, IOTA_SRC);
    let kernel = Kernel::create(&program, "iota").unwrap();
    let out = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 64, None).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(Some(out))).unwrap();

    let err = rocl::enqueue_nd_range_kernel(
        &h.queue,
        &kernel,
        1,
        None,
        &[16],
        None,
        std::slice::from_ref(&foreign),
    )
    .unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_CONTEXT);
}
