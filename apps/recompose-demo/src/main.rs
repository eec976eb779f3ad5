#![allow(non_snake_case)]

use anyhow::{bail, Context, Result};
use recompose_core::{mutable_state_of, with_key, Composition, MutableState, Node, Operation, TreeApplier};
use recompose_macros::composable;
use recompose_runtime_std::StdRuntime;

const ROW_KEY: u64 = 0x726f_77;
const LIST_KEY: u64 = 0x6c69_7374;
const MAX_FRAMES_PER_STEP: usize = 16;

#[derive(Default)]
struct ListNode;

impl Node for ListNode {
    fn describe(&self) -> String {
        "List".to_string()
    }
}

#[derive(Default)]
struct RowNode {
    label: String,
}

impl Node for RowNode {
    fn describe(&self) -> String {
        format!("Row({})", self.label)
    }
}

#[composable]
fn Row(label: String) {
    recompose_core::emit(
        ROW_KEY,
        RowNode::default,
        |node| node.set(label, |row: &mut RowNode, label| row.label = label),
        || {},
    );
}

#[composable]
fn List(items: MutableState<Vec<String>>, frames: MutableState<u64>) {
    recompose_core::emit(LIST_KEY, ListNode::default, |_| {}, || {
        for item in items.get() {
            with_key(&item, || Row(item.clone()));
        }
    });
    Row(format!("frames {}", frames.get()));
}

fn print_operations(step: &str, operations: &[Operation]) {
    println!("-- {step}: {} operation(s)", operations.len());
    for operation in operations {
        println!("   {operation:?}");
    }
}

fn settle(runtime: &StdRuntime) -> Result<()> {
    let frames = runtime.run_until_idle(MAX_FRAMES_PER_STEP).context("running frames")?;
    if runtime.recomposer().needs_frame() {
        bail!("runtime still busy after {frames} frames");
    }
    Ok(())
}

fn main() -> Result<()> {
    #[cfg(feature = "logging")]
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    println!("=== recompose keyed list demo ===");

    let runtime = StdRuntime::new();
    let items = mutable_state_of(
        ["alpha", "beta", "gamma", "delta", "epsilon"]
            .iter()
            .map(|item| item.to_string())
            .collect::<Vec<_>>(),
    );
    let frames = mutable_state_of(0u64);

    let mut composition = Composition::new(TreeApplier::new(), runtime.recomposer());
    composition
        .set_content({
            let items = items.clone();
            let frames = frames.clone();
            move || {
                let frames_for_effect = frames.clone();
                recompose_core::LaunchedEffect!((), move |scope| async move {
                    for _ in 0..3 {
                        if !scope.is_active() {
                            break;
                        }
                        scope.next_frame().await;
                        frames_for_effect.set(frames_for_effect.get_untracked() + 1);
                    }
                });
                List(items.clone(), frames.clone());
            }
        })
        .context("initial composition")?;
    print_operations("initial", &composition.applier_mut().take_operations());

    settle(&runtime)?;
    print_operations("frame ticks", &composition.applier_mut().take_operations());

    let mut rotated = items.get_untracked();
    rotated.rotate_left(1);
    items.set(rotated);
    settle(&runtime)?;
    print_operations("rotate", &composition.applier_mut().take_operations());

    let mut edited = items.get_untracked();
    edited.retain(|item| item != "gamma");
    edited.insert(1, "zeta".to_string());
    items.set(edited);
    settle(&runtime)?;
    print_operations("remove and insert", &composition.applier_mut().take_operations());

    println!("-- final tree");
    print!("{}", composition.applier().dump());

    composition.dispose().context("disposing composition")?;
    runtime.recomposer().close();
    log::info!("recomposer finished in state {:?}", runtime.state());
    Ok(())
}
