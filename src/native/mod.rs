//! The native DWARF engine: a process controller for compiled binaries.
//!
//! Parses the debuggee's object file up front, plants software breakpoints
//! through ptrace, unwinds call frames from CFI and renders locals from
//! DWARF locations. One engine instance drives exactly one debuggee.

pub mod breakpoint;
pub mod dwarf;
pub mod error;
pub mod process;
pub mod registers;
pub mod tracer;

use crate::config::Settings;
use crate::driver::{
    BreakpointView, Driver, DriverError, DriverKind, FrameView, InspectOutcome, InspectRequest,
    LaunchConfig, RunAction, ScopeKind, StopReason, StopState, VariableView,
};
use crate::native::dwarf::eval::{self, EvalContext};
use crate::native::dwarf::unwind::Unwinder;
use crate::native::dwarf::{DebugInfo, DieRef};
use crate::native::error::Error;
use crate::native::registers::RegisterSnapshot;
use crate::native::tracer::{StopEvent, Tracer};
use crate::sandbox::SandboxPolicy;
use gimli::{AttributeValue, Reader as _};
use nix::sys;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;

const STEP_INSTRUCTION_LIMIT: u32 = 200_000;

/// Hit-count filter of a breakpoint: `N`, `>N` or `%N`.
#[derive(Debug, Clone, Copy, PartialEq)]
enum HitCondition {
    Exact(u32),
    Greater(u32),
    Multiple(u32),
}

impl HitCondition {
    fn parse(s: &str) -> Option<HitCondition> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('>') {
            return rest.trim().parse().ok().map(HitCondition::Greater);
        }
        if let Some(rest) = s.strip_prefix('%') {
            let n: u32 = rest.trim().parse().ok()?;
            return (n != 0).then_some(HitCondition::Multiple(n));
        }
        s.parse().ok().map(HitCondition::Exact)
    }

    fn met(self, hits: u32) -> bool {
        match self {
            HitCondition::Exact(n) => hits == n,
            HitCondition::Greater(n) => hits > n,
            HitCondition::Multiple(n) => hits % n == 0,
        }
    }
}

/// One user breakpoint: trap bookkeeping plus the source request that
/// produced it.
struct UserBreakpoint {
    id: u32,
    file: String,
    line: u32,
    /// Relocated runtime address.
    addr: u64,
    condition: Option<String>,
    hit_condition: Option<HitCondition>,
    hits: u32,
    verified: bool,
    trap: breakpoint::Breakpoint,
}

impl UserBreakpoint {
    fn view(&self) -> BreakpointView {
        BreakpointView {
            id: self.id,
            file: self.file.clone(),
            line: self.line,
            condition: self.condition.clone(),
            verified: self.verified,
        }
    }
}

/// The running debuggee and everything derived from its binary.
struct Inferior {
    proc: process::Debuggee,
    tracer: Tracer,
    info: DebugInfo,
    /// Runtime mapping base (zero for non-PIE).
    base: u64,
    alive: bool,
}

impl Inferior {
    fn pid(&self) -> Pid {
        self.proc.pid
    }

    fn global_pc(&self) -> Result<u64, Error> {
        Ok(registers::get_pc(self.pid())?.wrapping_sub(self.base))
    }
}

/// Native debugger backend implementing the driver contract.
pub struct NativeDriver {
    settings: Settings,
    sandbox: SandboxPolicy,
    inferior: Option<Inferior>,
    launch_config: Option<LaunchConfig>,
    breakpoints: Vec<UserBreakpoint>,
    next_breakpoint_id: u32,
    /// variables_reference handles; cleared on every run.
    handles: HashMap<u32, Vec<eval::ChildSlot>>,
    next_handle: u32,
}

impl NativeDriver {
    pub fn new(settings: Settings, sandbox: SandboxPolicy) -> Self {
        Self {
            settings,
            sandbox,
            inferior: None,
            launch_config: None,
            breakpoints: Vec::new(),
            next_breakpoint_id: 1,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    fn inferior_mut(&mut self) -> Result<&mut Inferior, DriverError> {
        match self.inferior.as_mut() {
            Some(inf) if inf.alive => Ok(inf),
            _ => Err(DriverError::NotPaused),
        }
    }

    fn alloc_handle(&mut self, children: Vec<eval::ChildSlot>) -> u32 {
        if children.is_empty() {
            return 0;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, children);
        handle
    }

    fn kill_inferior(&mut self) {
        if let Some(inf) = self.inferior.as_mut() {
            if inf.alive {
                inf.proc.kill();
                inf.alive = false;
            } else {
                inf.proc.reap();
            }
        }
    }

    fn restart(&mut self) -> crate::driver::Result<StopState> {
        let config = self
            .launch_config
            .clone()
            .ok_or_else(|| DriverError::BackendError("nothing launched yet".into()))?;
        self.kill_inferior();
        self.inferior = None;
        self.launch(&config)?;
        Ok(StopState::new(StopReason::Entry))
    }

    /// Re-plant every recorded breakpoint into a fresh debuggee.
    fn replant_breakpoints(&mut self) -> Result<(), Error> {
        let Some(inf) = self.inferior.as_mut() else {
            return Ok(());
        };
        for bp in &mut self.breakpoints {
            let place = inf.info.place_for_line(Path::new(&bp.file), bp.line as u64)?;
            bp.addr = place.address.wrapping_add(inf.base);
            bp.line = place.line as u32;
            bp.trap = breakpoint::Breakpoint::new(bp.addr, inf.pid());
            bp.trap.enable().map_err(Error::Ptrace)?;
            bp.hits = 0;
        }
        Ok(())
    }

    fn scope_variables(
        &mut self,
        scope: ScopeKind,
        frame_id: u32,
    ) -> Result<Vec<VariableView>, Error> {
        let inf = self.inferior.as_ref().expect("checked by caller");
        let unwinder = Unwinder::new(&inf.info, inf.base);
        let registers = unwinder.registers_at_frame(inf.pid(), frame_id)?;
        let adjust = if frame_id > 0 { 1 } else { 0 };
        let lookup_pc = registers.pc().wrapping_sub(inf.base).wrapping_sub(adjust);

        let func = inf.info.find_function_by_pc(lookup_pc);
        let vars: Vec<DieRef> = match scope {
            ScopeKind::Locals => func
                .map(|f| inf.info.variables_in_scope(f, lookup_pc, false))
                .unwrap_or_default(),
            ScopeKind::Arguments => func
                .map(|f| inf.info.variables_in_scope(f, lookup_pc, true))
                .unwrap_or_default(),
            ScopeKind::Globals => inf.info.globals_at(lookup_pc),
        };

        let frame_base = match (func, scope) {
            (Some(func), ScopeKind::Locals | ScopeKind::Arguments) => {
                compute_frame_base(inf, func, &registers, lookup_pc)?
            }
            _ => None,
        };

        let ecx = EvalContext {
            info: &inf.info,
            pid: inf.pid(),
            base: inf.base,
        };
        let mut views = Vec::with_capacity(vars.len());
        let mut pending: Vec<(usize, Vec<eval::ChildSlot>)> = vec![];
        for var in vars {
            let name = inf
                .info
                .die(var)
                .name
                .clone()
                .unwrap_or_else(|| "<anon>".into());
            match ecx.evaluate_die(var, &registers, frame_base) {
                Ok(value) => {
                    if !value.children.is_empty() {
                        pending.push((views.len(), value.children.clone()));
                    }
                    views.push(VariableView {
                        name,
                        value: value.value,
                        type_name: value.type_name,
                        variables_reference: 0,
                        children_count: value.children.len() as u32,
                    });
                }
                Err(e) => {
                    log::debug!(target: "tracer", "variable {name} unavailable: {e:#}");
                    views.push(VariableView::scalar(name, "<unavailable>", ""));
                }
            }
        }
        for (index, children) in pending {
            views[index].variables_reference = self.alloc_handle(children);
        }
        Ok(views)
    }

    fn expand_reference(&mut self, reference: u32) -> crate::driver::Result<Vec<VariableView>> {
        let slots = self
            .handles
            .get(&reference)
            .cloned()
            .ok_or(DriverError::UnknownReference(reference))?;
        let inf = self.inferior_mut()?;
        let ecx = EvalContext {
            info: &inf.info,
            pid: inf.pid(),
            base: inf.base,
        };

        let mut rendered = Vec::with_capacity(slots.len());
        for slot in &slots {
            let value = ecx
                .render_slot(slot)
                .unwrap_or_else(|_| eval::Evaluated {
                    value: "<unavailable>".into(),
                    type_name: String::new(),
                    children: vec![],
                });
            rendered.push((slot.name.clone(), value));
        }

        let mut views = Vec::with_capacity(rendered.len());
        for (name, value) in rendered {
            let children_count = value.children.len() as u32;
            let reference = self.alloc_handle(value.children);
            views.push(VariableView {
                name,
                value: value.value,
                type_name: value.type_name,
                variables_reference: reference,
                children_count,
            });
        }
        Ok(views)
    }

    fn frames(&self) -> Result<Vec<FrameView>, Error> {
        let inf = self.inferior.as_ref().ok_or(Error::ProcessNotStarted)?;
        let unwinder = Unwinder::new(&inf.info, inf.base);
        let backtrace = unwinder.backtrace(inf.pid())?;
        Ok(backtrace
            .into_iter()
            .enumerate()
            .map(|(index, span)| FrameView {
                id: index as u32,
                name: span.func_name.unwrap_or_else(|| "??".into()),
                source_path: span.place.as_ref().map(|p| p.file.clone()),
                line: span.place.as_ref().map(|p| p.line as u32).unwrap_or(0),
                column: span.place.as_ref().map(|p| p.column as u32).unwrap_or(0),
            })
            .collect())
    }
}

impl Driver for NativeDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Dwarf
    }

    fn launch(&mut self, config: &LaunchConfig) -> crate::driver::Result<()> {
        let program = config.program.display().to_string();
        let info = DebugInfo::parse(&config.program)
            .map_err(|e| DriverError::SpawnFailed(program.clone(), e.to_string()))?;

        let proc = process::Debuggee::launch(config, &self.sandbox)
            .map_err(|e| DriverError::SpawnFailed(program.clone(), e.to_string()))?;
        let pid = proc.pid;
        let base = match process::mapping_base(pid, &config.program, info.is_pie()) {
            Ok(base) => base,
            Err(e) => {
                let mut proc = proc;
                proc.kill();
                return Err(DriverError::SpawnFailed(program, e.to_string()));
            }
        };

        self.inferior = Some(Inferior {
            proc,
            tracer: Tracer::new(pid, self.settings.timeout),
            info,
            base,
            alive: true,
        });
        self.launch_config = Some(config.clone());

        if let Err(e) = self.replant_breakpoints() {
            self.kill_inferior();
            return Err(DriverError::SpawnFailed(program, e.to_string()));
        }
        Ok(())
    }

    fn run(&mut self, action: RunAction) -> crate::driver::Result<StopState> {
        if action == RunAction::Restart {
            return self.restart();
        }

        // stop states invalidate old structure handles
        self.handles.clear();
        self.next_handle = 1;

        self.inferior_mut()?;
        let inf = self.inferior.as_mut().expect("checked above");
        let breakpoints = &mut self.breakpoints;

        let outcome = match action {
            RunAction::Continue => run_until_stop(inf, breakpoints, None),
            RunAction::StepInto => step_into(inf, breakpoints),
            RunAction::StepOver => step_over(inf, breakpoints),
            RunAction::StepOut => step_out(inf, breakpoints),
            RunAction::Restart => unreachable!("handled above"),
        };

        match outcome {
            Ok(stop) => {
                if stop.is_final() {
                    inf.alive = false;
                    inf.proc.reap();
                }
                Ok(stop)
            }
            Err(e) if e.is_trace_fault() => {
                log::error!(target: "tracer", "trace fault: {e:#}");
                self.kill_inferior();
                Err(DriverError::BackendError(e.to_string()))
            }
            // debug-information trouble surfaces as an exception stop, the
            // session stays usable
            Err(e) => Ok(StopState::exception(e.to_string())),
        }
    }

    fn set_breakpoint(
        &mut self,
        file: &Path,
        line: u32,
        condition: Option<&str>,
        hit_condition: Option<&str>,
    ) -> crate::driver::Result<BreakpointView> {
        if !self.sandbox.is_read_allowed(file) {
            return Err(DriverError::FileNotIndexed(file.display().to_string()));
        }
        if let Some(cond) = condition {
            validate_condition(cond)?;
        }
        let hit_condition = match hit_condition {
            Some(raw) => Some(HitCondition::parse(raw).ok_or_else(|| {
                DriverError::BackendError(format!(
                    "unsupported hit condition `{raw}` (expected N, >N or %N)"
                ))
            })?),
            None => None,
        };

        let inf = self.inferior_mut()?;
        let place = inf
            .info
            .place_for_line(file, line as u64)
            .map_err(to_driver_error)?;
        let addr = place.address.wrapping_add(inf.base);
        let pid = inf.pid();

        // duplicate line requests dedupe on address
        if let Some(existing) = self.breakpoints.iter_mut().find(|b| b.addr == addr) {
            existing.condition = condition.map(str::to_string);
            existing.hit_condition = hit_condition;
            return Ok(existing.view());
        }

        let trap = breakpoint::Breakpoint::new(addr, pid);
        trap.enable()
            .map_err(|e| DriverError::BackendError(Error::Ptrace(e).to_string()))?;

        let bp = UserBreakpoint {
            id: self.next_breakpoint_id,
            file: file.display().to_string(),
            line: place.line as u32,
            addr,
            condition: condition.map(str::to_string),
            hit_condition,
            hits: 0,
            verified: true,
            trap,
        };
        self.next_breakpoint_id += 1;
        log::debug!(target: "tracer", "breakpoint {} at {addr:#x} ({}:{})", bp.id, bp.file, bp.line);
        let view = bp.view();
        self.breakpoints.push(bp);
        Ok(view)
    }

    fn remove_breakpoint(&mut self, id: u32) -> crate::driver::Result<()> {
        let position = self
            .breakpoints
            .iter()
            .position(|b| b.id == id)
            .ok_or(DriverError::UnknownBreakpoint(id))?;
        let bp = self.breakpoints.remove(position);
        let alive = self.inferior.as_ref().map(|i| i.alive).unwrap_or(false);
        if alive && bp.trap.is_enabled() {
            if let Err(e) = bp.trap.disable() {
                log::warn!(target: "tracer", "breakpoint restore failed: {e}");
            }
        }
        Ok(())
    }

    fn list_breakpoints(&self) -> Vec<BreakpointView> {
        self.breakpoints.iter().map(UserBreakpoint::view).collect()
    }

    fn inspect(&mut self, request: &InspectRequest) -> crate::driver::Result<InspectOutcome> {
        self.inferior_mut()?;

        match request {
            InspectRequest::Stack => {
                let frames = self.frames().map_err(to_driver_error)?;
                Ok(InspectOutcome::Frames(frames))
            }
            InspectRequest::Scope { scope, frame_id } => {
                let views = self
                    .scope_variables(*scope, *frame_id)
                    .map_err(to_driver_error)?;
                Ok(InspectOutcome::Variables(views))
            }
            InspectRequest::Variable {
                variables_reference,
            } => Ok(InspectOutcome::Variables(
                self.expand_reference(*variables_reference)?,
            )),
            InspectRequest::Expression {
                expression,
                frame_id,
            } => {
                let inf = self.inferior.as_ref().expect("checked above");
                let value = evaluate_path(inf, expression, *frame_id).map_err(|e| match e {
                    Error::FrameNotFound(n) => DriverError::BadFrame(n),
                    other => DriverError::EvaluationFailed(other.to_string()),
                })?;
                let children_count = value.children.len() as u32;
                let reference = self.alloc_handle(value.children);
                Ok(InspectOutcome::Value(VariableView {
                    name: expression.clone(),
                    value: value.value,
                    type_name: value.type_name,
                    variables_reference: reference,
                    children_count,
                }))
            }
        }
    }

    fn stop(&mut self) {
        self.kill_inferior();
        self.handles.clear();
    }

    fn detach(&mut self) {
        if let Some(inf) = self.inferior.as_mut() {
            if inf.alive {
                for bp in &self.breakpoints {
                    if bp.trap.is_enabled() {
                        if let Err(e) = bp.trap.disable() {
                            log::warn!(target: "tracer", "breakpoint restore failed: {e}");
                        }
                    }
                }
                if let Err(e) = sys::ptrace::detach(inf.pid(), None) {
                    log::warn!(target: "tracer", "detach failed: {e}");
                }
                inf.alive = false;
            }
        }
    }
}

impl Drop for NativeDriver {
    fn drop(&mut self) {
        self.kill_inferior();
    }
}

fn to_driver_error(e: Error) -> DriverError {
    match e {
        Error::FileNotIndexed(file) => DriverError::FileNotIndexed(file),
        Error::NoPlaceForLine(file, line) => DriverError::LineHasNoCode(file, line),
        Error::FrameNotFound(n) => DriverError::BadFrame(n),
        Error::VariableNotFound(name) => {
            DriverError::EvaluationFailed(format!("variable `{name}` not found"))
        }
        other => DriverError::BackendError(other.to_string()),
    }
}

/// Conditions are `path == literal`; anything else is refused up front.
fn validate_condition(condition: &str) -> crate::driver::Result<()> {
    let valid = condition.split_once("==").is_some_and(|(lhs, rhs)| {
        let lhs = lhs.trim();
        !lhs.is_empty()
            && !rhs.trim().is_empty()
            && lhs
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    });
    if valid {
        Ok(())
    } else {
        Err(DriverError::BackendError(format!(
            "unsupported condition `{condition}` (expected `name == value`)"
        )))
    }
}

// ------------------------------- run control -------------------------------

/// Temporary traps used by step operations. Always removed before the stop
/// state is returned.
struct TempBreakpoints {
    traps: Vec<breakpoint::Breakpoint>,
}

impl TempBreakpoints {
    fn plant(addrs: &[u64], pid: Pid) -> Result<Self, Error> {
        let mut traps: Vec<breakpoint::Breakpoint> = Vec::with_capacity(addrs.len());
        for &addr in addrs {
            let trap = breakpoint::Breakpoint::new(addr, pid);
            if let Err(e) = trap.enable() {
                for planted in &traps {
                    let _ = planted.disable();
                }
                return Err(Error::Ptrace(e));
            }
            traps.push(trap);
        }
        Ok(Self { traps })
    }

    fn contains(&self, addr: u64) -> bool {
        self.traps.iter().any(|t| t.addr == addr)
    }

    fn clear(&self, debuggee_alive: bool) {
        if !debuggee_alive {
            return;
        }
        for trap in &self.traps {
            if trap.is_enabled() {
                let _ = trap.disable();
            }
        }
    }
}

/// If the current PC sits on an enabled breakpoint, execute the original
/// instruction before resuming. Returns the exit code if the debuggee
/// finishes during the step.
fn step_past_breakpoint(
    inf: &mut Inferior,
    breakpoints: &[UserBreakpoint],
) -> Result<Option<i32>, Error> {
    let pc = registers::get_pc(inf.pid())?;
    if let Some(bp) = breakpoints
        .iter()
        .find(|b| b.addr == pc && b.trap.is_enabled())
    {
        bp.trap.disable().map_err(Error::Ptrace)?;
        if let StopEvent::Exited(code) = inf.tracer.single_step(None)? {
            inf.alive = false;
            return Ok(Some(code));
        }
        bp.trap.enable().map_err(Error::Ptrace)?;
    }
    Ok(None)
}

/// One instruction forward, transparent to planted breakpoints.
fn single_step_instruction(
    inf: &mut Inferior,
    breakpoints: &[UserBreakpoint],
) -> Result<Option<i32>, Error> {
    let pc = registers::get_pc(inf.pid())?;
    if breakpoints
        .iter()
        .any(|b| b.addr == pc && b.trap.is_enabled())
    {
        return step_past_breakpoint(inf, breakpoints);
    }
    match inf.tracer.single_step(None)? {
        StopEvent::Exited(code) => {
            inf.alive = false;
            Ok(Some(code))
        }
        _ => Ok(None),
    }
}

/// Resume execution until a reportable stop. User breakpoints filter
/// through their hit counts and conditions; temp traps report a step.
fn run_until_stop(
    inf: &mut Inferior,
    breakpoints: &mut [UserBreakpoint],
    temps: Option<&TempBreakpoints>,
) -> Result<StopState, Error> {
    loop {
        if let Some(code) = step_past_breakpoint(inf, breakpoints)? {
            return Ok(StopState::exited(code));
        }

        match inf.tracer.resume(None)? {
            StopEvent::Exited(code) => {
                inf.alive = false;
                return Ok(StopState::exited(code));
            }
            StopEvent::TrapHit { pc } => {
                if let Some(index) = breakpoints.iter().position(|b| b.addr == pc) {
                    breakpoints[index].hits += 1;
                    if breakpoint_stop_wanted(inf, &breakpoints[index]) {
                        return Ok(StopState::new(StopReason::Breakpoint));
                    }
                    continue;
                }
                if temps.is_some_and(|t| t.contains(pc)) {
                    return Ok(StopState::new(StopReason::Step));
                }
                log::debug!(target: "tracer", "trap at {pc:#x} outside breakpoint table");
                return Ok(StopState::new(StopReason::Breakpoint));
            }
            StopEvent::Signal(signal) => {
                return Ok(StopState::exception(format!("signal {signal}")));
            }
            StopEvent::SingleStep => {}
        }
    }
}

fn breakpoint_stop_wanted(inf: &Inferior, bp: &UserBreakpoint) -> bool {
    if let Some(hit_condition) = bp.hit_condition {
        if !hit_condition.met(bp.hits) {
            return false;
        }
    }
    let Some(condition) = &bp.condition else {
        return true;
    };
    match eval_condition(inf, condition) {
        Ok(met) => met,
        Err(e) => {
            // an unevaluable condition must not hide the stop
            log::warn!(target: "tracer", "breakpoint condition `{condition}`: {e:#}");
            true
        }
    }
}

fn eval_condition(inf: &Inferior, condition: &str) -> Result<bool, Error> {
    let (path, literal) = condition
        .split_once("==")
        .ok_or(Error::VariableNotFound(condition.to_string()))?;
    let value = evaluate_path(inf, path.trim(), 0)?;
    let literal = literal.trim().trim_matches('"');
    let rendered = value.value.trim();
    if rendered == literal {
        return Ok(true);
    }
    // numeric comparison tolerates representation differences
    match (rendered.parse::<i64>(), literal.parse::<i64>()) {
        (Ok(a), Ok(b)) => Ok(a == b),
        _ => Ok(false),
    }
}

/// Single-step until the source line changes.
fn step_into(inf: &mut Inferior, breakpoints: &mut [UserBreakpoint]) -> Result<StopState, Error> {
    let start = inf.info.find_place_from_pc(inf.global_pc()?);
    for _ in 0..STEP_INSTRUCTION_LIMIT {
        if let Some(code) = single_step_instruction(inf, breakpoints)? {
            return Ok(StopState::exited(code));
        }
        let place = inf.info.find_place_from_pc(inf.global_pc()?);
        match (&start, &place) {
            (_, None) => continue,
            (None, Some(_)) => return Ok(StopState::new(StopReason::Step)),
            (Some(from), Some(to)) if from.file != to.file || from.line != to.line => {
                return Ok(StopState::new(StopReason::Step));
            }
            _ => {}
        }
    }
    Ok(StopState::exception("step did not reach a new line"))
}

/// Run until PC leaves the current line but stays in (or returns past)
/// the current function: temp traps on the function's other statement rows
/// and on the return address.
fn step_over(inf: &mut Inferior, breakpoints: &mut [UserBreakpoint]) -> Result<StopState, Error> {
    let global_pc = inf.global_pc()?;
    let func = inf
        .info
        .find_function_by_pc(global_pc)
        .ok_or(Error::FunctionNotFound(global_pc))?;
    let current = inf
        .info
        .find_place_from_pc(global_pc)
        .ok_or(Error::PlaceNotFound(global_pc))?;

    let mut addrs: Vec<u64> = inf
        .info
        .statement_addresses(func)
        .into_iter()
        .filter(|addr| *addr != current.address)
        .map(|addr| addr.wrapping_add(inf.base))
        .filter(|addr| !breakpoints.iter().any(|b| b.addr == *addr))
        .collect();

    let unwinder = Unwinder::new(&inf.info, inf.base);
    if let Some(return_addr) = unwinder.return_address(inf.pid())? {
        if !addrs.contains(&return_addr) && !breakpoints.iter().any(|b| b.addr == return_addr) {
            addrs.push(return_addr);
        }
    }

    let temps = TempBreakpoints::plant(&addrs, inf.pid())?;
    let outcome = run_until_stop(inf, breakpoints, Some(&temps));
    temps.clear(inf.alive);
    outcome
}

/// Temp trap at the return address of the current frame, then continue.
fn step_out(inf: &mut Inferior, breakpoints: &mut [UserBreakpoint]) -> Result<StopState, Error> {
    let unwinder = Unwinder::new(&inf.info, inf.base);
    let return_addr = unwinder
        .return_address(inf.pid())?
        .ok_or(Error::NoUnwindInfo(registers::get_pc(inf.pid())?))?;

    if breakpoints.iter().any(|b| b.addr == return_addr) {
        return run_until_stop(inf, breakpoints, None);
    }

    let temps = TempBreakpoints::plant(&[return_addr], inf.pid())?;
    let outcome = run_until_stop(inf, breakpoints, Some(&temps));
    temps.clear(inf.alive);
    outcome
}

// ------------------------------- inspection --------------------------------

fn compute_frame_base(
    inf: &Inferior,
    func: DieRef,
    registers: &RegisterSnapshot,
    lookup_pc: u64,
) -> Result<Option<u64>, Error> {
    let die = inf.info.die(func);
    let Some(attr) = die.fb_addr.as_ref() else {
        return Ok(None);
    };
    let expr = match attr.value() {
        AttributeValue::Exprloc(expr) => expr,
        _ => return Err(Error::FBANotAnExpression),
    };
    let bytes = expr.0.to_slice()?;
    match eval::decode_frame_base(&bytes)? {
        eval::FrameBaseRule::Cfa => {
            let unwinder = Unwinder::new(&inf.info, inf.base);
            unwinder.cfa_with(registers, lookup_pc).map(Some)
        }
        eval::FrameBaseRule::Register(register, offset) => Ok(Some(
            registers.value(register)?.wrapping_add(offset as u64),
        )),
    }
}

/// Evaluate a `name.field.field` path against a frame.
fn evaluate_path(inf: &Inferior, path: &str, frame_id: u32) -> Result<eval::Evaluated, Error> {
    let unwinder = Unwinder::new(&inf.info, inf.base);
    let registers = unwinder.registers_at_frame(inf.pid(), frame_id)?;
    let adjust = if frame_id > 0 { 1 } else { 0 };
    let lookup_pc = registers.pc().wrapping_sub(inf.base).wrapping_sub(adjust);

    let mut parts = path.split('.');
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::VariableNotFound(path.to_string()))?;

    let func = inf.info.find_function_by_pc(lookup_pc);
    let by_name = |vars: Vec<DieRef>| {
        vars.into_iter()
            .find(|v| inf.info.die(*v).name.as_deref() == Some(name))
    };
    let var = func
        .and_then(|f| by_name(inf.info.variables_in_scope(f, lookup_pc, false)))
        .or_else(|| by_name(inf.info.globals_at(lookup_pc)))
        .ok_or_else(|| Error::VariableNotFound(name.to_string()))?;

    let frame_base = match func {
        Some(func) => compute_frame_base(inf, func, &registers, lookup_pc)?,
        None => None,
    };

    let ecx = EvalContext {
        info: &inf.info,
        pid: inf.pid(),
        base: inf.base,
    };
    let mut value = ecx.evaluate_die(var, &registers, frame_base)?;
    for field in parts {
        let slot = value
            .children
            .iter()
            .find(|c| c.name == field)
            .cloned()
            .ok_or_else(|| Error::VariableNotFound(field.to_string()))?;
        value = ecx.render_slot(&slot)?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_conditions_parse_and_match() {
        let exact = HitCondition::parse("3").unwrap();
        assert!(!exact.met(2));
        assert!(exact.met(3));

        let greater = HitCondition::parse("> 2").unwrap();
        assert!(!greater.met(2));
        assert!(greater.met(5));

        let every = HitCondition::parse("%2").unwrap();
        assert!(every.met(4));
        assert!(!every.met(5));

        assert_eq!(HitCondition::parse("%0"), None);
        assert_eq!(HitCondition::parse("sometimes"), None);
    }

    #[test]
    fn conditions_validate_up_front() {
        assert!(validate_condition("x == 42").is_ok());
        assert!(validate_condition("point.x == -1").is_ok());
        assert!(validate_condition("x > 42").is_err());
        assert!(validate_condition("== 42").is_err());
        assert!(validate_condition("x ==").is_err());
    }
}
