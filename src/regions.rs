/// Exception regions and control-flow bookkeeping
/// Derives region events from handler metadata and collects branch
/// targets for the lowering loop
use hashbrown::{HashMap, HashSet};

use crate::ir::StackEntry;
use crate::metadata::{ExceptionHandler, HandlerKind, Instruction};
use crate::opcodes::CilOp;

#[derive(Debug, Clone, PartialEq)]
pub enum RegionEvent {
    HandlerEnd,
    TryBegin,
    CatchBegin { exc_type: Option<String> },
    FilterBegin,
    FilterHandlerBegin,
    FinallyBegin,
}

fn event_rank(event: &RegionEvent) -> u8 {
    match event {
        RegionEvent::HandlerEnd => 0,
        RegionEvent::TryBegin => 1,
        RegionEvent::CatchBegin { .. }
        | RegionEvent::FilterBegin
        | RegionEvent::FilterHandlerBegin => 2,
        RegionEvent::FinallyBegin => 3,
    }
}

/// Region events keyed by their opening bytecode offset, plus the try
/// extents of finally handlers for `leave` suppression.
#[derive(Debug, Default)]
pub struct RegionModel {
    events: HashMap<u32, Vec<RegionEvent>>,
    finally_tries: Vec<(u32, u32)>,
}

impl RegionModel {
    pub fn build(handlers: &[ExceptionHandler]) -> Self {
        let mut raw: Vec<(u32, RegionEvent)> = Vec::new();
        let mut try_begins_seen: HashSet<(u32, u32)> = HashSet::new();
        let mut finally_tries = Vec::new();

        for handler in handlers {
            // Chained catches share one protected region; open it once.
            if try_begins_seen.insert((handler.try_start, handler.try_end)) {
                raw.push((handler.try_start, RegionEvent::TryBegin));
            }
            match handler.kind {
                HandlerKind::Catch => {
                    raw.push((
                        handler.handler_start,
                        RegionEvent::CatchBegin {
                            exc_type: handler.catch_type.clone(),
                        },
                    ));
                }
                HandlerKind::Filter => {
                    if let Some(filter_start) = handler.filter_start {
                        raw.push((filter_start, RegionEvent::FilterBegin));
                    }
                    raw.push((handler.handler_start, RegionEvent::FilterHandlerBegin));
                }
                HandlerKind::Finally | HandlerKind::Fault => {
                    raw.push((handler.handler_start, RegionEvent::FinallyBegin));
                    finally_tries.push((handler.try_start, handler.try_end));
                }
            }

            // A HandlerEnd is suppressed when another handler for the
            // same try opens at the same offset (chained catches).
            let chained = handlers.iter().any(|other| {
                !std::ptr::eq(other, handler)
                    && other.try_start == handler.try_start
                    && other.try_end == handler.try_end
                    && (other.handler_start == handler.handler_end
                        || other.filter_start == Some(handler.handler_end))
            });
            if !chained {
                raw.push((handler.handler_end, RegionEvent::HandlerEnd));
            }
        }

        let mut events: HashMap<u32, Vec<RegionEvent>> = HashMap::new();
        for (offset, event) in raw {
            events.entry(offset).or_default().push(event);
        }
        for list in events.values_mut() {
            list.sort_by_key(event_rank);
        }

        Self { events, finally_tries }
    }

    pub fn events_at(&self, offset: u32) -> &[RegionEvent] {
        self.events.get(&offset).map_or(&[], |v| v.as_slice())
    }

    /// A `leave` from inside a finally-protected try whose target lies at
    /// or past the try end is a no-op; control must fall through into the
    /// finally block for the unwinder.
    pub fn leave_is_suppressed(&self, source: u32, target: u32) -> bool {
        self.finally_tries
            .iter()
            .any(|&(start, end)| source >= start && source < end && target >= end)
    }
}

/// First scan: every offset any branch, switch or leave can transfer to.
pub fn collect_branch_targets(body: &[Instruction]) -> HashSet<u32> {
    let mut targets = HashSet::new();
    for ins in body {
        match &ins.op {
            CilOp::Br(t)
            | CilOp::BrS(t)
            | CilOp::BrFalse(t)
            | CilOp::BrFalseS(t)
            | CilOp::BrTrue(t)
            | CilOp::BrTrueS(t)
            | CilOp::Beq(t)
            | CilOp::BeqS(t)
            | CilOp::Bge(t)
            | CilOp::BgeS(t)
            | CilOp::Bgt(t)
            | CilOp::BgtS(t)
            | CilOp::Ble(t)
            | CilOp::BleS(t)
            | CilOp::Blt(t)
            | CilOp::BltS(t)
            | CilOp::BneUn(t)
            | CilOp::BneUnS(t)
            | CilOp::BgeUn(t)
            | CilOp::BgeUnS(t)
            | CilOp::BgtUn(t)
            | CilOp::BgtUnS(t)
            | CilOp::BleUn(t)
            | CilOp::BleUnS(t)
            | CilOp::BltUn(t)
            | CilOp::BltUnS(t)
            | CilOp::Leave(t)
            | CilOp::LeaveS(t) => {
                targets.insert(*t);
            }
            CilOp::Switch(cases) => {
                targets.extend(cases.iter().copied());
            }
            _ => {}
        }
    }
    targets
}

pub fn label_name(offset: u32) -> String {
    format!("IL_{:04x}", offset)
}

/// Merge variables must be assignable C++ lvalues. Literals, nullptr,
/// string literals, casts and address-of expressions are rejected.
pub fn is_valid_merge_target(entry: &StackEntry) -> bool {
    let expr = entry.expr.as_str();
    if expr.is_empty() || entry.is_null() || entry.is_address_of() {
        return false;
    }
    if expr == "true" || expr == "false" {
        return false;
    }
    let first = expr.chars().next().unwrap_or(' ');
    if first.is_ascii_digit() || first == '-' || first == '(' || first == '"' {
        return false;
    }
    if expr.starts_with("u\"") {
        return false;
    }
    // Call expressions produce rvalues.
    !expr.ends_with(')')
}
