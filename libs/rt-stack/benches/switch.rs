use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rt_stack::{Context, Stack, jump_into, spawn, switch};

fn context_switch(c: &mut Criterion) {
    let stack = Stack::new(64 * 1024).unwrap();
    let main_ctx = Context::empty();
    let main_ctx_ptr: *const Context = &main_ctx;

    // Safety: `main_ctx_ptr` outlives every switch below, which only
    // returns once this benchmark thread resumes `main_ctx` again.
    let thread_ctx = spawn(&stack, move || loop {
        unsafe { jump_into(&*main_ctx_ptr) }
    });

    c.bench_function("context_switch_round_trip", |b| {
        b.iter(|| {
            // Safety: both contexts come from `Context::empty`/`spawn` and
            // this benchmark drives them from a single thread only.
            unsafe { switch(black_box(&main_ctx), black_box(&thread_ctx)) };
        });
    });
}

fn stack_alloc(c: &mut Criterion) {
    c.bench_function("guarded_stack_alloc", |b| {
        b.iter(|| black_box(Stack::new(64 * 1024).unwrap()));
    });
}

criterion_group!(benches, context_switch, stack_alloc);
criterion_main!(benches);
