//! Every unrecoverable condition has to end up in the fault handler. The
//! handlers used here panic with the fault's message, so the tests can check
//! for it.
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use sramalloc::{Allocator, Fault, SeparateStack};

fn halt(fault: Fault) -> ! {
    panic!("{}", fault)
}

#[test_log::test]
#[should_panic(expected = "zero bytes requested (line 44)")]
fn zero_sized_allocation() {
    let allocator = Allocator::<64, _>::new(SeparateStack, halt);
    let _ = allocator.allocate(0, 44);
}

#[test_log::test]
#[should_panic(expected = "Double free")]
fn double_free() {
    let allocator = Allocator::<64, _>::new(SeparateStack, halt);
    let a = allocator.allocate(1, 39).unwrap();
    allocator.deallocate(a.as_ptr());
    allocator.deallocate(a.as_ptr()); // panic here
}

#[test_log::test]
#[should_panic(expected = "Attempted to free unallocated block")]
fn freeing_memory_inside_of_a_payload() {
    let allocator = Allocator::<64, _>::new(SeparateStack, halt);
    let a = allocator.allocate(16, line!() as u16).unwrap();
    allocator.deallocate(unsafe { a.as_ptr().add(8) });
}

#[test_log::test]
#[should_panic(expected = "Attempted to free unallocated block")]
fn freeing_memory_of_another_allocator() {
    let allocator = Allocator::<64, _>::new(SeparateStack, halt);
    let other = Allocator::<64, _>::new(SeparateStack, halt);
    let _ = allocator.allocate(4, line!() as u16).unwrap();
    let foreign = other.allocate(4, line!() as u16).unwrap();
    allocator.deallocate(foreign.as_ptr());
}

#[test_log::test]
#[should_panic(expected = "Attempted to free unallocated block")]
fn freeing_null() {
    let allocator = Allocator::<64, _>::new(SeparateStack, halt);
    allocator.deallocate(std::ptr::null_mut());
}

#[test_log::test]
#[should_panic(expected = "Buffer overrun")]
fn writing_past_the_payload() {
    let allocator = Allocator::<64, _>::new(SeparateStack, halt);
    let a = allocator.allocate(5, line!() as u16).unwrap();
    unsafe { a.as_ptr().write_bytes(0, 6) };
    allocator.deallocate(a.as_ptr());
}

#[test_log::test]
#[should_panic(expected = "Buffer overrun")]
fn writing_past_the_payload_of_a_reused_block() {
    let allocator = Allocator::<64, _>::new(SeparateStack, halt);
    let a = allocator.allocate(5, line!() as u16).unwrap();
    allocator.deallocate(a.as_ptr());
    let b = allocator.allocate(4, line!() as u16).unwrap();
    assert_eq!(a, b);
    unsafe { b.as_ptr().add(4).write(0) };
    allocator.deallocate(b.as_ptr());
}

#[test_log::test]
#[should_panic(expected = "Buffer overrun")]
fn verification_finds_overruns() {
    let allocator = Allocator::<64, _>::new(SeparateStack, halt);
    let a = allocator.allocate(3, line!() as u16).unwrap();
    let _b = allocator.allocate(3, line!() as u16).unwrap();
    allocator.verify();
    unsafe { a.as_ptr().add(3).write(0) };
    allocator.verify();
}

#[test_log::test]
#[should_panic(expected = "Heap corruption")]
fn damaged_header_is_found_by_the_next_allocation() {
    let allocator = Allocator::<64, _>::new(SeparateStack, halt);
    let a = allocator.allocate(2, line!() as u16).unwrap();
    let _b = allocator.allocate(2, line!() as u16).unwrap();
    // skip the trailer and hit the header of the following block
    unsafe { a.as_ptr().add(4).write_bytes(0xff, 2) };
    let _ = allocator.allocate(1, line!() as u16);
}

#[test_log::test]
#[should_panic(expected = "Stack/Heap collision")]
fn stack_heap_collision_on_allocation() {
    let stack_pointer = Cell::new(usize::MAX);
    let allocator = Allocator::<64, _>::new(|| stack_pointer.get(), halt);
    let _ = allocator.allocate(8, line!() as u16).unwrap();

    stack_pointer.set(allocator.heap_end() + 5);
    let _ = allocator.allocate(1, line!() as u16);
}

#[test_log::test]
#[should_panic(expected = "Stack/Heap collision")]
fn stack_heap_collision_on_deallocation() {
    let stack_pointer = Cell::new(usize::MAX);
    let allocator = Allocator::<64, _>::new(|| stack_pointer.get(), halt);
    let a = allocator.allocate(8, line!() as u16).unwrap();

    stack_pointer.set(allocator.heap_end() + 9);
    allocator.deallocate(a.as_ptr());
}

#[test_log::test]
fn custom_safety_margin() {
    let stack_pointer = Cell::new(usize::MAX);
    let allocator = Allocator::<64, _>::with_safety_margin(|| stack_pointer.get(), halt, 0);
    let a = allocator.allocate(8, line!() as u16).unwrap();

    stack_pointer.set(allocator.heap_end());
    allocator.deallocate(a.as_ptr());
}

static REENTRANT: Allocator<64, fn() -> usize> = Allocator::new(allocating_stack_pointer, halt);

/// A stack pointer source calling back into the allocator, like an interrupt
/// handler firing in the middle of an allocation would do.
fn allocating_stack_pointer() -> usize {
    let _ = REENTRANT.allocate(1, line!() as u16);
    usize::MAX
}

#[test_log::test]
#[should_panic(expected = "re-entered")]
fn reentrant_calls_are_detected() {
    let _ = REENTRANT.allocate(1, line!() as u16);
}

static COUNTED_FAULTS: AtomicUsize = AtomicUsize::new(0);

fn counting(fault: Fault) -> ! {
    COUNTED_FAULTS.fetch_add(1, Ordering::SeqCst);
    panic!("{}", fault)
}

#[test_log::test]
fn handler_is_called_exactly_once_per_fault() {
    let allocator = Allocator::<64, _>::new(SeparateStack, counting);
    let a = allocator.allocate(1, line!() as u16).unwrap();
    allocator.deallocate(a.as_ptr());

    let result = panic::catch_unwind(AssertUnwindSafe(|| allocator.deallocate(a.as_ptr())));
    assert!(result.is_err());
    assert_eq!(COUNTED_FAULTS.load(Ordering::SeqCst), 1);

    // the allocator is still usable after the handler was invoked
    let b = allocator.allocate(1, line!() as u16).unwrap();
    assert_eq!(a, b);
    let result = panic::catch_unwind(AssertUnwindSafe(|| allocator.allocate(0, 7)));
    assert!(result.is_err());
    assert_eq!(COUNTED_FAULTS.load(Ordering::SeqCst), 2);
}
