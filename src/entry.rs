use crate::alloc::CodeSlice;

/// The largest redirect any instruction set uses (Thumb FULL plus
/// alignment padding).
pub const MAX_REDIRECT_SIZE: usize = 10;

/// The interception styles a hook entry can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
  /// Redirect calls to `replace_call`; the relocated prologue stays
  /// reachable through the invoke trampoline so the replacement can
  /// call back into the original.
  FunctionReplace,
  /// Wrap the call: enter thunk before, leave thunk after, the invoke
  /// trampoline runs the original body.
  FunctionEnterLeave,
  /// Intercept a single instruction site; after the relocated
  /// instruction runs, control transfers to the insn-leave trampoline.
  OneInstruction,
  /// Redirect through an indirect pointer owned by the registry; no
  /// patch is written and no transfer bridge is built.
  FunctionViaGOT,
  /// Enter-only interception routed through the DBI thunk.
  DynamicBinaryInstrumentation,
}

/// The target bytes displaced by the redirect.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginPrologue {
  pub bytes: [u8; MAX_REDIRECT_SIZE],
  pub size: usize,
  pub address: usize,
}

/// One hooked address and everything the builder produced for it.
///
/// The registry creates an entry, passes it through the builder
/// operations and keeps it alive (and unmoved — the trampolines embed
/// the entry's address as the callback argument) until the hook is
/// uninstalled. Trampoline pointers carry the Thumb mode bit where the
/// stub is Thumb code.
pub struct HookEntry {
  /// Target address, mode bit included for Thumb targets.
  pub target: usize,
  pub kind: HookKind,
  /// Replacement routine for `FunctionReplace` hooks.
  pub replace_call: usize,
  /// User callback dispatched by the enter thunk.
  pub on_enter_callback: usize,
  /// User callback dispatched by the leave thunk.
  pub on_leave_callback: usize,
  /// User callback dispatched around the invoke trampoline.
  pub on_invoke_callback: usize,
  /// Request the single-branch redirect even where FULL would fit.
  pub try_near_jump: bool,

  pub origin_prologue: OriginPrologue,
  pub on_enter_trampoline: usize,
  pub on_enter_transfer_trampoline: usize,
  pub on_invoke_trampoline: usize,
  pub on_leave_trampoline: usize,
  pub on_insn_leave_trampoline: usize,
  pub on_dbi_trampoline: usize,
  /// For `OneInstruction` hooks: where callbacks resume the original
  /// flow inside the invoke trampoline.
  pub next_insn_addr: usize,

  pub(crate) redirect_code_size: usize,
  pub(crate) slices: Vec<CodeSlice>,
}

impl HookEntry {
  pub fn new(target: usize, kind: HookKind) -> Self {
    HookEntry {
      target,
      kind,
      replace_call: 0,
      on_enter_callback: 0,
      on_leave_callback: 0,
      on_invoke_callback: 0,
      try_near_jump: false,
      origin_prologue: OriginPrologue::default(),
      on_enter_trampoline: 0,
      on_enter_transfer_trampoline: 0,
      on_invoke_trampoline: 0,
      on_leave_trampoline: 0,
      on_insn_leave_trampoline: 0,
      on_dbi_trampoline: 0,
      next_insn_addr: 0,
      redirect_code_size: 0,
      slices: Vec::new(),
    }
  }

  /// Bytes the planner decided to overwrite at the target; zero until
  /// the entry is prepared.
  pub fn redirect_code_size(&self) -> usize {
    self.redirect_code_size
  }

  pub(crate) fn hold(&mut self, slice: CodeSlice) {
    self.slices.push(slice);
  }

  /// Releases the trampoline slices back to their allocator and clears
  /// the produced pointers. Accepts partially built state; the target's
  /// original bytes are not restored.
  pub fn free(&mut self) {
    self.slices.clear();
    self.on_enter_trampoline = 0;
    self.on_enter_transfer_trampoline = 0;
    self.on_invoke_trampoline = 0;
    self.on_leave_trampoline = 0;
    self.on_insn_leave_trampoline = 0;
    self.on_dbi_trampoline = 0;
    self.next_insn_addr = 0;
    self.redirect_code_size = 0;
  }
}
