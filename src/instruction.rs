//! Executed-instruction records delivered by the host tracer.
//!
//! Instructions arrive pre-decoded: the host hands over the runtime
//! address, the disassembly text, a control-flow classification and the
//! resolved branch target. The core never inspects raw bytes.

use serde::{Deserialize, Serialize};

/// Classification of an instruction's effect on control flow.
///
/// Anything other than [`BranchKind::None`] closes the basic block it is
/// appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchKind {
    /// Ordinary instruction, control falls through.
    None,
    /// Function call.
    Call,
    /// Function return.
    Return,
    /// Conditional jump.
    ConditionalJump,
    /// Unconditional jump.
    UnconditionalJump,
    /// Stack-frame teardown (x86 `leave`).
    Leave,
}

/// One executed instruction as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Runtime address of the instruction.
    pub address: u64,
    /// Disassembly text supplied by the host.
    pub text: String,
    /// Control-flow classification.
    pub kind: BranchKind,
    /// Byte length of the encoded instruction.
    pub length: u32,
    /// Branch target resolved by the host, 0 when not applicable.
    pub target: u64,
    /// Cross-module call annotation supplied by a sibling plugin.
    /// Shown in rendered labels, never persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_tag: Option<String>,
}

impl Instruction {
    /// Create a record without an API annotation.
    pub fn new(
        address: u64,
        text: impl Into<String>,
        kind: BranchKind,
        length: u32,
        target: u64,
    ) -> Self {
        Self {
            address,
            text: text.into(),
            kind,
            length,
            target,
            api_tag: None,
        }
    }

    /// Whether this instruction redirects control flow.
    pub fn is_branch(&self) -> bool {
        self.kind != BranchKind::None
    }

    /// Taken-path successor address, 0 when the kind has none.
    pub fn true_branch(&self) -> u64 {
        match self.kind {
            BranchKind::Call | BranchKind::ConditionalJump | BranchKind::UnconditionalJump => {
                self.target
            }
            _ => 0,
        }
    }

    /// Fall-through successor address, 0 when the kind has none.
    pub fn false_branch(&self) -> u64 {
        match self.kind {
            BranchKind::Call | BranchKind::ConditionalJump => {
                self.address.wrapping_add(u64::from(self.length))
            }
            _ => 0,
        }
    }

    /// A record is usable once it carries disassembly text and a length.
    /// The kind is a closed enum and needs no check of its own.
    pub fn validate(&self) -> bool {
        !self.text.is_empty() && self.length > 0
    }

    /// Label text for rendering, with the API annotation appended when
    /// present.
    pub fn display_text(&self) -> String {
        match &self.api_tag {
            Some(tag) => format!("{} {}", self.text, tag),
            None => self.text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_branch_has_no_successors() {
        let inst = Instruction::new(0x1000, "mov ebp, esp", BranchKind::None, 2, 0);
        assert!(!inst.is_branch());
        assert_eq!(inst.true_branch(), 0);
        assert_eq!(inst.false_branch(), 0);
    }

    #[test]
    fn test_true_branch_follows_target() {
        let inst = Instruction::new(0x1000, "jmp 0x6000", BranchKind::UnconditionalJump, 2, 0x6000);
        assert!(inst.is_branch());
        assert_eq!(inst.true_branch(), 0x6000);
        assert_eq!(inst.false_branch(), 0);
    }

    #[test]
    fn test_false_branch_is_fall_through() {
        let inst = Instruction::new(0x6000, "call 0x9000", BranchKind::Call, 4, 0x9000);
        assert_eq!(inst.true_branch(), 0x9000);
        assert_eq!(inst.false_branch(), 0x6004);

        let inst = Instruction::new(0x6000, "jne 0x9000", BranchKind::ConditionalJump, 2, 0x9000);
        assert_eq!(inst.false_branch(), 0x6002);
    }

    #[test]
    fn test_return_has_no_successors() {
        let inst = Instruction::new(0x2002, "ret", BranchKind::Return, 1, 0);
        assert!(inst.is_branch());
        assert_eq!(inst.true_branch(), 0);
        assert_eq!(inst.false_branch(), 0);
    }

    #[test]
    fn test_validate() {
        let inst = Instruction::new(0x1000, "", BranchKind::None, 2, 0);
        assert!(!inst.validate());

        let inst = Instruction::new(0x1000, "xor eax, eax", BranchKind::None, 0, 0);
        assert!(!inst.validate());

        let inst = Instruction::new(0x1000, "xor eax, eax", BranchKind::None, 2, 0);
        assert!(inst.validate());
    }

    #[test]
    fn test_display_text_appends_api_tag() {
        let mut inst = Instruction::new(0x1000, "call 0x9000", BranchKind::Call, 5, 0x9000);
        assert_eq!(inst.display_text(), "call 0x9000");

        inst.api_tag = Some("kernel32.dll!CreateFileW".to_string());
        assert_eq!(inst.display_text(), "call 0x9000 kernel32.dll!CreateFileW");
    }
}
