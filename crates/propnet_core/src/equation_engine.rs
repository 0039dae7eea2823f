use crate::error::{ModelError, Result};
use crate::traits::{ResidualSystem, Scalar};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of an unknown (by index) onto the stack.
    LoadVar(usize),
    /// Pushes the value of a known input (by index) onto the stack.
    LoadParam(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops top value (a), pushes f(a).
    Call(Function),
}

/// Built-in functions callable from equation strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Exp,
    /// Natural logarithm; both `log` and `ln` map here.
    Ln,
    Log10,
    Sqrt,
    Abs,
    Sinh,
    Cosh,
    Tanh,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "exp" => Function::Exp,
            "log" | "ln" => Function::Ln,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            _ => return None,
        };
        Some(function)
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Exp => "exp",
            Function::Ln => "ln",
            Function::Log10 => "log10",
            Function::Sqrt => "sqrt",
            Function::Abs => "abs",
            Function::Sinh => "sinh",
            Function::Cosh => "cosh",
            Function::Tanh => "tanh",
        }
    }

    fn apply<T: Scalar>(self, a: T) -> T {
        match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Exp => a.exp(),
            Function::Ln => a.ln(),
            Function::Log10 => a.log10(),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
            Function::Sinh => a.sinh(),
            Function::Cosh => a.cosh(),
            Function::Tanh => a.tanh(),
        }
    }
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `vars`: Unknowns being solved for (read-only).
/// - `params`: Known inputs (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the result of the evaluation (the value left on the stack).
pub struct VM;

impl VM {
    /// Executes the bytecode.
    ///
    /// # Type Parameters
    /// * `T`: The scalar type (e.g., `f64` or `Dual`).
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        vars: &[T],
        params: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(T::from_f64(val)),
                OpCode::LoadVar(idx) => stack.push(vars[idx]),
                OpCode::LoadParam(idx) => stack.push(params[idx]),
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Div => binary(stack, |a, b| a / b),
                OpCode::Pow => binary(stack, |a, b| a.powf(b)),
                OpCode::Neg => unary(stack, |a| -a),
                OpCode::Call(function) => unary(stack, |a| function.apply(a)),
            }
        }

        // Compiled bytecode always leaves exactly one value behind.
        stack.pop().unwrap_or_else(T::zero)
    }
}

fn binary<T: Scalar>(stack: &mut Vec<T>, op: impl Fn(T, T) -> T) {
    let b = stack.pop().unwrap_or_else(T::zero);
    let a = stack.pop().unwrap_or_else(T::zero);
    stack.push(op(a, b));
}

fn unary<T: Scalar>(stack: &mut Vec<T>, op: impl Fn(T) -> T) {
    let a = stack.pop().unwrap_or_else(T::zero);
    stack.push(op(a));
}

// --- AST & Parser ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
        }
    }
}

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Neg(Box<Expr>),
    Call(Function, Box<Expr>),
}

impl Expr {
    /// All variable names referenced by the expression.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables(&self, names: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                names.insert(name.clone());
            }
            Expr::Binary(left, _, right) => {
                left.collect_variables(names);
                right.collect_variables(names);
            }
            Expr::Neg(operand) | Expr::Call(_, operand) => operand.collect_variables(names),
        }
    }

    /// Evaluates the expression when it references no variables.
    pub fn constant_value(&self) -> Option<f64> {
        if !self.variables().is_empty() {
            return None;
        }
        let bytecode = Compiler::new(&[], &[]).compile(self).ok()?;
        let value = VM::execute::<f64>(&bytecode, &[], &[], &mut Vec::new());
        value.is_finite().then_some(value)
    }

    /// Rewrites every variable reference with `f`.
    pub fn map_variables(&self, f: &impl Fn(&str) -> Expr) -> Expr {
        match self {
            Expr::Number(n) => Expr::Number(*n),
            Expr::Variable(name) => f(name),
            Expr::Binary(left, op, right) => Expr::Binary(
                Box::new(left.map_variables(f)),
                *op,
                Box::new(right.map_variables(f)),
            ),
            Expr::Neg(operand) => Expr::Neg(Box::new(operand.map_variables(f))),
            Expr::Call(function, arg) => Expr::Call(*function, Box::new(arg.map_variables(f))),
        }
    }

    /// Splits a sum into its additive terms (signs dropped).
    /// `a - 2*b + c` yields `[a, 2*b, c]`.
    pub fn additive_terms(&self) -> Vec<&Expr> {
        let mut terms = Vec::new();
        self.collect_terms(&mut terms);
        terms
    }

    fn collect_terms<'a>(&'a self, terms: &mut Vec<&'a Expr>) {
        match self {
            Expr::Binary(left, BinaryOp::Add | BinaryOp::Sub, right) => {
                left.collect_terms(terms);
                right.collect_terms(terms);
            }
            Expr::Neg(operand) => operand.collect_terms(terms),
            other => terms.push(other),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Variable(name) => write!(f, "{name}"),
            Expr::Binary(left, op, right) => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Neg(operand) => write!(f, "-{operand}"),
            Expr::Call(function, arg) => write!(f, "{}({arg})", function.name()),
        }
    }
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves unknown and known names to indices.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        let var_map = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let param_map = param_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        Self { var_map, param_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else {
                    return Err(ModelError::UnknownVariable { name: name.clone() });
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                });
            }
            Expr::Neg(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(function, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(OpCode::Call(*function));
            }
        }
        Ok(())
    }
}

// --- Parser ---

/// Parses an expression or an equation into an AST.
///
/// A bare expression is read as `expr = 0`; `lhs = rhs` is rewritten to
/// `lhs - (rhs)`.
pub fn parse(input: &str) -> Result<Expr> {
    let mut parser = Parser::new(input)?;
    let lhs = parser.parse_expression()?;
    let expr = if parser.peek() == Some(&Token::Assign) {
        parser.consume();
        let rhs = parser.parse_expression()?;
        Expr::Binary(Box::new(lhs), BinaryOp::Sub, Box::new(rhs))
    } else {
        lhs
    };
    parser.expect_end()?;
    Ok(expr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
}

impl Comparison {
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Less => lhs < rhs,
            Comparison::LessEqual => lhs <= rhs,
            Comparison::Greater => lhs > rhs,
            Comparison::GreaterEqual => lhs >= rhs,
            Comparison::Equal => lhs == rhs,
            Comparison::NotEqual => lhs != rhs,
        }
    }
}

/// A parsed inequality such as `n > 0` or `K >= 2*G`.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub source: String,
    pub lhs: Expr,
    pub comparison: Comparison,
    pub rhs: Expr,
}

impl Constraint {
    pub fn variables(&self) -> BTreeSet<String> {
        let mut names = self.lhs.variables();
        names.extend(self.rhs.variables());
        names
    }

    /// Checks the constraint against known values.
    /// Returns `None` when some variable is not among `values`.
    pub fn check(&self, values: &HashMap<String, f64>) -> Option<bool> {
        let names: Vec<String> = self.variables().into_iter().collect();
        let params = names
            .iter()
            .map(|name| values.get(name).copied())
            .collect::<Option<Vec<f64>>>()?;
        let compiler = Compiler::new(&[], &names);
        let lhs = compiler.compile(&self.lhs).ok()?;
        let rhs = compiler.compile(&self.rhs).ok()?;
        let mut stack = Vec::with_capacity(16);
        let lhs = VM::execute::<f64>(&lhs, &[], &params, &mut stack);
        let rhs = VM::execute::<f64>(&rhs, &[], &params, &mut stack);
        Some(self.comparison.holds(lhs, rhs))
    }
}

/// Parses a constraint of the form `expr <op> expr`.
pub fn parse_constraint(input: &str) -> Result<Constraint> {
    let mut parser = Parser::new(input)?;
    let lhs = parser.parse_expression()?;
    let comparison = match parser.consume() {
        Some(Token::Compare(comparison)) => comparison,
        _ => return Err(parse_error(input, "expected a comparison operator")),
    };
    let rhs = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(Constraint {
        source: input.trim().to_string(),
        lhs,
        comparison,
        rhs,
    })
}

fn parse_error(input: &str, message: impl Into<String>) -> ModelError {
    ModelError::Parse {
        input: input.trim().to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Assign,
    Compare(Comparison),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            // Exponent part, only when a digit follows: `2e3`, `1.5E-4`.
            if matches!(chars.peek(), Some('e' | 'E')) {
                let mut lookahead = chars.clone();
                let mut exponent = String::from("e");
                lookahead.next();
                if let Some(&(sign @ ('+' | '-'))) = lookahead.peek() {
                    exponent.push(sign);
                    lookahead.next();
                }
                if lookahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                    while let Some(&d) = lookahead.peek() {
                        if !d.is_ascii_digit() {
                            break;
                        }
                        exponent.push(d);
                        lookahead.next();
                    }
                    num_str.push_str(&exponent);
                    chars = lookahead;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| parse_error(input, format!("invalid number '{num_str}'")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            chars.next();
            let next_is_eq = chars.peek() == Some(&'=');
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    Token::Caret
                }
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                '=' if next_is_eq => {
                    chars.next();
                    Token::Compare(Comparison::Equal)
                }
                '=' => Token::Assign,
                '<' if next_is_eq => {
                    chars.next();
                    Token::Compare(Comparison::LessEqual)
                }
                '<' => Token::Compare(Comparison::Less),
                '>' if next_is_eq => {
                    chars.next();
                    Token::Compare(Comparison::GreaterEqual)
                }
                '>' => Token::Compare(Comparison::Greater),
                '!' if next_is_eq => {
                    chars.next();
                    Token::Compare(Comparison::NotEqual)
                }
                other => return Err(parse_error(input, format!("unexpected character '{other}'"))),
            };
            tokens.push(token);
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(parse_error(input, "empty expression"));
        }
        Ok(Self {
            input,
            tokens,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ModelError {
        parse_error(self.input, message)
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("unexpected trailing token {token:?}"))),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_product()?;

        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // Unary minus binds looser than `^`: `-x^2` is `-(x^2)`.
    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let operand = self.parse_unary()?;
                Ok(Expr::Neg(Box::new(operand)))
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    // Right associative: `a^b^c` is `a^(b^c)`.
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(
                Box::new(base),
                BinaryOp::Pow,
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    let function = Function::from_name(&name)
                        .ok_or_else(|| self.error(format!("unknown function '{name}'")))?;
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    match self.consume() {
                        Some(Token::RParen) => Ok(Expr::Call(function, Box::new(arg))),
                        _ => Err(self.error("expected ')'")),
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(token) => Err(self.error(format!("unexpected token {token:?}"))),
            None => Err(self.error("unexpected end of input")),
        }
    }
}

// --- EquationSystem ---

/// Residual system built from compiled equations.
/// Each equation is compiled whole and split into its additive terms; the
/// terms give the reference magnitude for relative convergence tests.
pub struct EquationSystem<T: Scalar> {
    pub equations: Vec<Bytecode>,
    pub terms: Vec<Vec<Bytecode>>,
    pub params: Vec<T>,
    pub unknowns: usize,
    // Interior mutability for VM stack to avoid allocation in apply.
    // Note: This makes the system !Sync; one is built per solve.
    pub stack: RefCell<Vec<T>>,
}

impl<T: Scalar> EquationSystem<T> {
    pub fn new(
        equations: Vec<Bytecode>,
        terms: Vec<Vec<Bytecode>>,
        params: Vec<T>,
        unknowns: usize,
    ) -> Self {
        Self {
            equations,
            terms,
            params,
            unknowns,
            stack: RefCell::new(Vec::with_capacity(64)),
        }
    }

    /// Compiles `exprs` with `unknowns` as variables and `param_names` as
    /// known inputs bound to `params`.
    pub fn compile(
        exprs: &[&Expr],
        unknowns: &[String],
        param_names: &[String],
        params: Vec<T>,
    ) -> Result<Self> {
        let compiler = Compiler::new(unknowns, param_names);
        let mut equations = Vec::with_capacity(exprs.len());
        let mut terms = Vec::with_capacity(exprs.len());
        for expr in exprs {
            equations.push(compiler.compile(expr)?);
            terms.push(
                expr.additive_terms()
                    .into_iter()
                    .map(|term| compiler.compile(term))
                    .collect::<Result<Vec<_>>>()?,
            );
        }
        Ok(Self::new(equations, terms, params, unknowns.len()))
    }

    /// Same system over another scalar type (e.g. `Dual` for Jacobians).
    pub fn convert<U: Scalar>(&self) -> EquationSystem<U> {
        EquationSystem::new(
            self.equations.clone(),
            self.terms.clone(),
            self.params
                .iter()
                .map(|p| U::from_f64(p.real()))
                .collect(),
            self.unknowns,
        )
    }
}

impl<T: Scalar> ResidualSystem<T> for EquationSystem<T> {
    fn unknowns(&self) -> usize {
        self.unknowns
    }

    fn residuals(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, x: &[T], out: &mut [T]) {
        let mut stack = self.stack.borrow_mut();
        for (i, eq) in self.equations.iter().enumerate() {
            out[i] = VM::execute(eq, x, &self.params, &mut stack);
        }
    }

    fn magnitudes(&self, x: &[T], out: &mut [T]) {
        let mut stack = self.stack.borrow_mut();
        for (i, terms) in self.terms.iter().enumerate() {
            out[i] = terms.iter().fold(T::zero(), |acc, term| {
                acc + VM::execute(term, x, &self.params, &mut stack).abs()
            });
        }
    }
}
