use std::fmt;

/// Per-call execution properties carried by a reproducer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallProps {
    /// Fault injection index. Positive values request that the nth fallible
    /// operation inside the call fails; zero and negative values disable
    /// injection for the call.
    pub fail_nth: i32,
}

/// One call of a reproducer. The call text (name plus arguments) is opaque
/// to this system; only the property block is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    text: String,
    pub props: CallProps,
}

impl Call {
    pub fn new<T: Into<String>>(text: T, props: CallProps) -> Self {
        Self {
            text: text.into(),
            props,
        }
    }

    /// Call text without the property block.
    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Name of the called function, skipping a `rN = ` result binding.
    pub fn name(&self) -> &str {
        let text = match self.text.find('=') {
            Some(idx) => self.text[idx + 1..].trim_start(),
            None => &self.text,
        };
        match text.find('(') {
            Some(idx) => &text[..idx],
            None => text,
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.props.fail_nth > 0 {
            write!(f, "{} (fail_nth: {})", self.text, self.props.fail_nth)
        } else {
            write!(f, "{}", self.text)
        }
    }
}

/// A parsed reproducer program: an ordered sequence of calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prog {
    calls: Vec<Call>,
}

impl Prog {
    pub fn new(calls: Vec<Call>) -> Self {
        Self { calls }
    }

    #[inline]
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    #[inline]
    pub fn calls_mut(&mut self) -> &mut [Call] {
        &mut self.calls
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Stable textual form, one call per line with a trailing newline.
    /// Parsing the output yields an equal program.
    pub fn serialize(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Prog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for call in &self.calls {
            writeln!(f, "{}", call)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_name() {
        let call = Call::new("openat(0x0, &(0x7f00)='./file0\\x00', 0x0)", CallProps::default());
        assert_eq!(call.name(), "openat");
        let bound = Call::new("r0 = socket(0x2, 0x1, 0x0)", CallProps::default());
        assert_eq!(bound.name(), "socket");
    }

    #[test]
    fn serialize_attaches_props() {
        let prog = Prog::new(vec![
            Call::new("socket(0x2, 0x1, 0x0)", CallProps { fail_nth: 3 }),
            Call::new("close(0x3)", CallProps::default()),
        ]);
        let text = String::from_utf8(prog.serialize()).unwrap();
        assert_eq!(text, "socket(0x2, 0x1, 0x0) (fail_nth: 3)\nclose(0x3)\n");
    }
}
