//! taskbench Example: one problem, four backends
//!
//! Sums a vector of `i64` with a sequential, a thread-based, a rayon and a
//! message-passing implementation. Each backend gets a functional test and
//! a perf test.
//!
//! Run with:
//!   cargo run --example sum_backends                     # single process
//!   cargo run --example sum_backends -- --processes 4    # four ranks
//!   cargo run --example sum_backends -- --kind perf      # perf tests only
//!   cargo run --example sum_backends -- --list           # show the plan

use rayon::prelude::*;
use std::sync::Arc;
use taskbench::prelude::*;

const PERF_LEN: usize = 1 << 20;

/// Contract shared by every backend: one `i64` input vector, one output slot
fn sum_contract(values: &[i64]) -> BufferContract {
    BufferContract::new()
        .with_input(values)
        .with_output::<i64>(1)
}

fn sum_contract_ok(data: &BufferContract) -> bool {
    data.num_inputs() == 1 && data.output_counts() == [1]
}

fn load(data: &BufferContract) -> Option<Vec<i64>> {
    data.input::<i64>(0).ok().map(<[i64]>::to_vec)
}

fn store(data: &mut BufferContract, total: i64) -> bool {
    match data.output_mut::<i64>(0) {
        Ok(out) => {
            out[0] = total;
            true
        }
        Err(_) => false,
    }
}

#[derive(Default)]
struct SumSeq {
    values: Vec<i64>,
    total: i64,
}

impl Task for SumSeq {
    fn validate(&mut self, data: &BufferContract) -> bool {
        sum_contract_ok(data)
    }

    fn pre_process(&mut self, data: &mut BufferContract) -> bool {
        load(data).map(|v| self.values = v).is_some()
    }

    fn run(&mut self, _data: &mut BufferContract) -> bool {
        self.total = self.values.iter().sum();
        true
    }

    fn post_process(&mut self, data: &mut BufferContract) -> bool {
        store(data, self.total)
    }
}

struct SumThreads {
    threads: usize,
    values: Vec<i64>,
    total: i64,
}

impl Task for SumThreads {
    fn validate(&mut self, data: &BufferContract) -> bool {
        self.threads > 0 && sum_contract_ok(data)
    }

    fn pre_process(&mut self, data: &mut BufferContract) -> bool {
        load(data).map(|v| self.values = v).is_some()
    }

    fn run(&mut self, _data: &mut BufferContract) -> bool {
        let chunk = self.values.len().div_ceil(self.threads).max(1);
        self.total = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .values
                .chunks(chunk)
                .map(|part| scope.spawn(move || part.iter().sum::<i64>()))
                .collect();
            handles.into_iter().filter_map(|h| h.join().ok()).sum::<i64>()
        });
        true
    }

    fn post_process(&mut self, data: &mut BufferContract) -> bool {
        store(data, self.total)
    }

    fn backend(&self) -> Backend {
        Backend::Threads
    }
}

#[derive(Default)]
struct SumRayon {
    values: Vec<i64>,
    total: i64,
}

impl Task for SumRayon {
    fn validate(&mut self, data: &BufferContract) -> bool {
        sum_contract_ok(data)
    }

    fn pre_process(&mut self, data: &mut BufferContract) -> bool {
        load(data).map(|v| self.values = v).is_some()
    }

    fn run(&mut self, _data: &mut BufferContract) -> bool {
        self.total = self.values.par_iter().sum();
        true
    }

    fn post_process(&mut self, data: &mut BufferContract) -> bool {
        store(data, self.total)
    }

    fn backend(&self) -> Backend {
        Backend::TaskBased
    }
}

/// Every rank sums a slice; the driver collects partials and broadcasts the total
struct SumMessagePassing {
    comm: Arc<dyn Communicator>,
    values: Vec<i64>,
    total: i64,
}

const PARTIAL_TAG: i32 = 1;
const TOTAL_TAG: i32 = 2;

impl SumMessagePassing {
    fn reduce(&self) -> Result<i64, taskbench::CommError> {
        let size = self.comm.world_size() as usize;
        let rank = self.comm.rank() as usize;
        let chunk = self.values.len().div_ceil(size);
        let start = (rank * chunk).min(self.values.len());
        let end = (start + chunk).min(self.values.len());
        let partial: i64 = self.values[start..end].iter().sum();

        let mut total = vec![partial];
        if self.comm.is_driver() {
            for _ in 1..size {
                let (_, values) = self.comm.recv_values::<i64>(None, Some(PARTIAL_TAG))?;
                total[0] += values.iter().sum::<i64>();
            }
        } else {
            self.comm.send_values(0, PARTIAL_TAG, &[partial])?;
        }
        self.comm.broadcast_values(0, TOTAL_TAG, &mut total)?;
        Ok(total.first().copied().unwrap_or_default())
    }
}

impl Task for SumMessagePassing {
    fn validate(&mut self, data: &BufferContract) -> bool {
        sum_contract_ok(data)
    }

    fn pre_process(&mut self, data: &mut BufferContract) -> bool {
        load(data).map(|v| self.values = v).is_some()
    }

    fn run(&mut self, _data: &mut BufferContract) -> bool {
        match self.reduce() {
            Ok(total) => {
                self.total = total;
                true
            }
            Err(_) => false,
        }
    }

    fn post_process(&mut self, data: &mut BufferContract) -> bool {
        store(data, self.total)
    }

    fn backend(&self) -> Backend {
        Backend::MessagePassing
    }
}

fn check_sum<T: Task>(ctx: &mut TestContext, task: T) {
    let values: Vec<i64> = (1..=1000).collect();
    let expected: i64 = values.iter().sum();
    let mut runner = ctx.runner(task, sum_contract(&values));

    ctx.expect_ok(runner.run_pipeline(), "sum pipeline");
    let total = runner.with_data(|d| d.output::<i64>(0).map(|o| o[0]));
    ctx.expect(total == Ok(expected), format!("expected {expected}, got {total:?}"));
    ctx.expect_ok(runner.finish().map(|_| true), "task lifecycle");
}

fn measure_sum<T: Task>(ctx: &mut TestContext, task: T, run_only: bool) {
    let values = vec![1i64; PERF_LEN];
    let mut runner = ctx.runner(task, sum_contract(&values));
    let attr = ctx.perf_attr(DEFAULT_ITERATIONS);

    let measured = if run_only {
        Perf::measure_run_only_checked(&mut runner, &attr)
    } else {
        Perf::measure_pipeline(&mut runner, &attr)
    };
    match measured {
        Ok(result) => {
            ctx.print_statistic(&result);
            let total = runner.with_data(|d| d.output::<i64>(0).map(|o| o[0]));
            let expected = PERF_LEN as i64;
            ctx.expect(total == Ok(expected), format!("sum after measurement: {total:?}"));
        }
        Err(e) => ctx.fail(format!("measurement failed: {e}")),
    }
    ctx.expect_ok(runner.finish().map(|_| true), "task lifecycle");
}

#[task_test(suite = "sum", name = "seq")]
fn sum_seq(ctx: &mut TestContext) {
    check_sum(ctx, SumSeq::default());
}

#[task_test(suite = "sum", name = "threads")]
fn sum_threads(ctx: &mut TestContext) {
    let threads = ctx.settings().num_threads;
    check_sum(
        ctx,
        SumThreads {
            threads,
            values: Vec::new(),
            total: 0,
        },
    );
}

#[task_test(suite = "sum", name = "rayon")]
fn sum_rayon(ctx: &mut TestContext) {
    check_sum(ctx, SumRayon::default());
}

#[task_test(suite = "sum", name = "message_passing")]
fn sum_message_passing(ctx: &mut TestContext) {
    let comm = Arc::clone(ctx.comm());
    check_sum(
        ctx,
        SumMessagePassing {
            comm,
            values: Vec::new(),
            total: 0,
        },
    );
}

#[task_test(suite = "sum", name = "rejects_missing_output")]
fn sum_rejects_missing_output(ctx: &mut TestContext) {
    let data = BufferContract::new().with_input(&[1i64, 2, 3]);
    let mut runner = ctx.runner(SumSeq::default(), data);
    ctx.expect_ok(runner.validate().map(|ok| !ok), "validation rejects the contract");
    ctx.expect_ok(runner.finish().map(|_| true), "rejected cycle closes the ledger");
}

#[task_test(suite = "sum_perf", name = "seq_pipeline", kind = "perf")]
fn sum_seq_pipeline(ctx: &mut TestContext) {
    measure_sum(ctx, SumSeq::default(), false);
}

#[task_test(suite = "sum_perf", name = "seq_task_run", kind = "perf")]
fn sum_seq_task_run(ctx: &mut TestContext) {
    measure_sum(ctx, SumSeq::default(), true);
}

#[task_test(suite = "sum_perf", name = "rayon_task_run", kind = "perf")]
fn sum_rayon_task_run(ctx: &mut TestContext) {
    measure_sum(ctx, SumRayon::default(), true);
}

#[task_test(suite = "sum_perf", name = "message_passing_pipeline", kind = "perf")]
fn sum_message_passing_pipeline(ctx: &mut TestContext) {
    let comm = Arc::clone(ctx.comm());
    measure_sum(
        ctx,
        SumMessagePassing {
            comm,
            values: Vec::new(),
            total: 0,
        },
        false,
    );
}

fn main() {
    taskbench::run();
}
