//! Rule DSL parser.
//!
//! Recursive descent parser for the rule grammar. Converts text to AST with
//! meaningful error messages including character offset, expected/found tokens.
//! Keywords are upper case; price fields and cycle levels are lower case.

use crate::domain::cycle::Translation;
use crate::domain::error::ParseError;
use crate::domain::instrument::CycleLevel;
use crate::domain::rule::{CycleRef, LevelSelector, Operand, Rule};

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            message,
            position: self.pos,
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            Some(ch) => Err(self.error(format!("expected '{}', found '{}'", expected, ch))),
            None => Err(self.error(format!("expected '{}', found end of input", expected))),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        let remaining = self.remaining();
        remaining.starts_with(keyword)
            && (remaining.len() == keyword.len()
                || !remaining[keyword.len()..]
                    .chars()
                    .next()
                    .map(|c| c.is_alphanumeric() || c == '_')
                    .unwrap_or(false))
    }

    fn consume_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        self.skip_whitespace();
        if self.consume_keyword(keyword) {
            Ok(())
        } else {
            let found = self.peek_word();
            Err(self.error(format!("expected '{}', found '{}'", keyword, found)))
        }
    }

    fn word_len(&self) -> usize {
        self.remaining()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .map(char::len_utf8)
            .sum()
    }

    fn peek_word(&self) -> String {
        let len = self.word_len();
        if len == 0 {
            self.peek()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "end of input".to_string())
        } else {
            self.remaining()[..len].to_string()
        }
    }

    fn take_word(&mut self) -> Option<&'a str> {
        let len = self.word_len();
        if len == 0 {
            return None;
        }
        let word = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Some(word)
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        let mut has_dot = false;
        let mut digits = 0;

        if self.peek() == Some('-') {
            self.advance();
        }

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }

        if digits == 0 {
            return Err(ParseError {
                message: "expected number".to_string(),
                position: start,
            });
        }

        let num_str = &self.input[start..self.pos];
        num_str.parse::<f64>().map_err(|_| ParseError {
            message: format!("invalid number: {}", num_str),
            position: start,
        })
    }

    fn parse_level(&mut self) -> Result<CycleLevel, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        let word = self.peek_word();
        let level = match word.as_str() {
            "short" => CycleLevel::Short,
            "medium" => CycleLevel::Medium,
            "long" => CycleLevel::Long,
            _ => {
                return Err(ParseError {
                    message: format!(
                        "expected cycle level (short, medium, long), found '{}'",
                        word
                    ),
                    position: start,
                });
            }
        };
        self.pos += word.len();
        Ok(level)
    }

    /// `level`, `PARENT(level)` or `INSTRUMENT:level`.
    fn parse_cycle(&mut self) -> Result<CycleRef, ParseError> {
        self.skip_whitespace();

        if self.consume_keyword("PARENT") {
            self.expect_char('(')?;
            let level = self.parse_level()?;
            self.expect_char(')')?;
            return Ok(CycleRef {
                instrument: None,
                selector: LevelSelector::Parent(level),
            });
        }

        let len = self.word_len();
        if len > 0 && self.remaining()[len..].starts_with(':') {
            let instrument = self.take_word().unwrap_or_default().to_uppercase();
            self.advance();
            let level = self.parse_level()?;
            return Ok(CycleRef {
                instrument: Some(instrument),
                selector: LevelSelector::Level(level),
            });
        }

        let level = self.parse_level()?;
        Ok(CycleRef {
            instrument: None,
            selector: LevelSelector::Level(level),
        })
    }

    fn parse_cycle_call(&mut self, keyword: &str) -> Result<CycleRef, ParseError> {
        self.expect_keyword(keyword)?;
        self.expect_char('(')?;
        let cycle = self.parse_cycle()?;
        self.expect_char(')')?;
        Ok(cycle)
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        self.skip_whitespace();

        if self
            .peek()
            .is_some_and(|ch| ch.is_ascii_digit() || ch == '-' || ch == '.')
        {
            let num = self.parse_number()?;
            return Ok(Operand::Constant(num));
        }

        if self.peek() == Some('$') {
            self.advance();
            return match self.take_word() {
                Some(name) => Ok(Operand::Param(name.to_lowercase())),
                None => Err(self.error("expected parameter name after '$'".to_string())),
            };
        }

        if self.consume_keyword("close") {
            return Ok(Operand::Close);
        }
        if self.consume_keyword("POSITION") {
            return Ok(Operand::Position);
        }

        type Build = fn(CycleRef) -> Operand;
        let cycle_operands: [(&str, Build); 7] = [
            ("ELAPSED", Operand::Elapsed),
            ("SCORE", Operand::Score),
            ("MIDPOINT", Operand::Midpoint),
            ("WINDOW_MIN", Operand::WindowMin),
            ("WINDOW_MAX", Operand::WindowMax),
            ("GAIN", Operand::Gain),
            ("WEAK_STREAK", Operand::WeakStreak),
        ];
        for (keyword, build) in cycle_operands {
            if self.peek_keyword(keyword) {
                let cycle = self.parse_cycle_call(keyword)?;
                return Ok(build(cycle));
            }
        }

        let word = self.peek_word();
        Err(self.error(format!("expected operand, found '{}'", word)))
    }

    fn parse_comparison(&mut self, keyword: &str) -> Result<Rule, ParseError> {
        self.expect_keyword(keyword)?;
        self.expect_char('(')?;

        let left = self.parse_operand()?;
        self.expect_char(',')?;
        let right = self.parse_operand()?;
        self.expect_char(')')?;

        match keyword {
            "ABOVE" => Ok(Rule::Above { left, right }),
            "BELOW" => Ok(Rule::Below { left, right }),
            "AT_LEAST" => Ok(Rule::AtLeast { left, right }),
            "AT_MOST" => Ok(Rule::AtMost { left, right }),
            _ => Ok(Rule::Equals { left, right }),
        }
    }

    fn parse_translation(&mut self) -> Result<Rule, ParseError> {
        self.expect_keyword("TRANSLATION")?;
        self.expect_char('(')?;
        let cycle = self.parse_cycle()?;
        self.expect_char(',')?;
        self.skip_whitespace();

        let translation = if self.consume_keyword("PENDING") {
            Translation::Pending
        } else if self.consume_keyword("LEFT") {
            Translation::Left
        } else if self.consume_keyword("RIGHT") {
            Translation::Right
        } else if self.consume_keyword("MID") {
            Translation::Mid
        } else {
            let word = self.peek_word();
            return Err(self.error(format!(
                "expected translation (PENDING, LEFT, RIGHT, MID), found '{}'",
                word
            )));
        };
        self.expect_char(')')?;
        Ok(Rule::Translation { cycle, translation })
    }

    fn parse_flag(&mut self) -> Result<Rule, ParseError> {
        self.expect_keyword("FLAG")?;
        self.expect_char('(')?;
        self.skip_whitespace();
        let name = match self.take_word() {
            Some(name) => name.to_lowercase(),
            None => return Err(self.error("expected flag name".to_string())),
        };
        self.expect_char(')')?;
        Ok(Rule::Flag(name))
    }

    fn parse_rule(&mut self) -> Result<Rule, ParseError> {
        self.skip_whitespace();

        for keyword in ["ABOVE", "BELOW", "AT_LEAST", "AT_MOST", "EQUALS"] {
            if self.peek_keyword(keyword) {
                return self.parse_comparison(keyword);
            }
        }

        if self.peek_keyword("AND") {
            return self.parse_list("AND").map(Rule::And);
        }
        if self.peek_keyword("OR") {
            return self.parse_list("OR").map(Rule::Or);
        }
        if self.peek_keyword("NOT") {
            return self.parse_not();
        }

        if self.peek_keyword("TRANSLATION") {
            return self.parse_translation();
        }
        if self.peek_keyword("FAILED") {
            return self.parse_cycle_call("FAILED").map(Rule::Failed);
        }
        if self.peek_keyword("PAST_MIDPOINT") {
            return self
                .parse_cycle_call("PAST_MIDPOINT")
                .map(Rule::PastMidpoint);
        }
        if self.peek_keyword("NEW_LOW") {
            return self.parse_cycle_call("NEW_LOW").map(Rule::NewLow);
        }
        if self.peek_keyword("STALE") {
            return self.parse_cycle_call("STALE").map(Rule::Stale);
        }
        if self.peek_keyword("FLAG") {
            return self.parse_flag();
        }

        let word = self.peek_word();
        Err(self.error(format!("expected rule, found '{}'", word)))
    }

    fn parse_list(&mut self, keyword: &str) -> Result<Vec<Rule>, ParseError> {
        self.expect_keyword(keyword)?;
        self.expect_char('(')?;

        let mut rules = Vec::new();
        rules.push(self.parse_rule()?);

        loop {
            self.skip_whitespace();
            if self.peek() == Some(')') {
                self.advance();
                break;
            }
            self.expect_char(',')?;
            rules.push(self.parse_rule()?);
        }

        if rules.len() < 2 {
            return Err(self.error(format!("{} requires at least 2 rules", keyword)));
        }

        Ok(rules)
    }

    fn parse_not(&mut self) -> Result<Rule, ParseError> {
        self.expect_keyword("NOT")?;
        self.expect_char('(')?;
        let rule = self.parse_rule()?;
        self.expect_char(')')?;
        Ok(Rule::Not(Box::new(rule)))
    }

    fn parse(&mut self) -> Result<Rule, ParseError> {
        let rule = self.parse_rule()?;
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(self.error(format!(
                "unexpected input after rule: '{}'",
                self.remaining()
            )));
        }
        Ok(rule)
    }
}

pub fn parse(input: &str) -> Result<Rule, ParseError> {
    let mut parser = Parser::new(input);
    parser.parse()
}
