//! Units and dimensional algebra.
//!
//! A unit is a set of SI base-dimension exponents plus a scale factor to the
//! coherent SI unit of that dimension:
//!
//! - `GPa`: mass 1, length -1, time -2, scale 1e9
//! - `g/cm^3`: mass 1, length -3, scale 1e3
//! - `eV`: mass 1, length 2, time -2, scale 1.602176634e-19
//!
//! Only multiplicative units are supported; affine temperature scales and
//! logarithmic units are rejected as unknown.
//!
//! Parsing accepts `*`, `·`, `/`, whitespace (implicit product), `^`, `**`,
//! superscript exponents and parentheses. Division is left associative, so
//! `J/mol/K` is `J·mol⁻¹·K⁻¹`.
//!
//! A token that only resolves through an SI prefix is also checked for a
//! second reading as two juxtaposed unit symbols: `ms` is millisecond, but
//! could have meant meter·second. The prefix reading wins and an
//! [`UnitWarning::Ambiguous`] is reported alongside the result.

use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SI base-dimension exponents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Dimensions {
    /// Length (L) - meter
    pub length: i8,
    /// Mass (M) - kilogram
    pub mass: i8,
    /// Time (T) - second
    pub time: i8,
    /// Electric current (I) - ampere
    pub current: i8,
    /// Temperature (Θ) - kelvin
    pub temperature: i8,
    /// Amount of substance (N) - mole
    pub amount: i8,
    /// Luminous intensity (J) - candela
    pub luminosity: i8,
    /// Plane angle - radian; dimensionless in SI but tracked
    pub angle: i8,
}

impl Dimensions {
    pub const DIMENSIONLESS: Dimensions = Dimensions {
        length: 0,
        mass: 0,
        time: 0,
        current: 0,
        temperature: 0,
        amount: 0,
        luminosity: 0,
        angle: 0,
    };

    const fn new(length: i8, mass: i8, time: i8, current: i8) -> Self {
        Dimensions {
            length,
            mass,
            time,
            current,
            ..Self::DIMENSIONLESS
        }
    }

    fn exponents(&self) -> [i8; 8] {
        [
            self.length,
            self.mass,
            self.time,
            self.current,
            self.temperature,
            self.amount,
            self.luminosity,
            self.angle,
        ]
    }

    fn from_exponents(e: [i8; 8]) -> Self {
        Dimensions {
            length: e[0],
            mass: e[1],
            time: e[2],
            current: e[3],
            temperature: e[4],
            amount: e[5],
            luminosity: e[6],
            angle: e[7],
        }
    }

    fn zip(&self, other: &Dimensions, f: impl Fn(i8, i8) -> Option<i8>) -> Option<Self> {
        let (a, b) = (self.exponents(), other.exponents());
        let mut out = [0i8; 8];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = f(a[i], b[i])?;
        }
        Some(Self::from_exponents(out))
    }

    pub fn is_dimensionless(&self) -> bool {
        *self == Self::DIMENSIONLESS
    }

    /// `None` when an exponent leaves the `i8` range.
    pub fn multiply(&self, other: &Dimensions) -> Option<Dimensions> {
        self.zip(other, i8::checked_add)
    }

    pub fn divide(&self, other: &Dimensions) -> Option<Dimensions> {
        self.zip(other, i8::checked_sub)
    }

    pub fn power(&self, exponent: i8) -> Option<Dimensions> {
        self.zip(&Self::DIMENSIONLESS, |e, _| e.checked_mul(exponent))
    }

    /// Raises to a real power; `None` unless every resulting exponent is
    /// an integer in range (`sqrt(m^2)` is fine, `sqrt(m)` is not).
    pub fn powf(&self, exponent: f64) -> Option<Dimensions> {
        let mut out = [0i8; 8];
        for (slot, e) in out.iter_mut().zip(self.exponents()) {
            let scaled = f64::from(e) * exponent;
            let rounded = scaled.round();
            if (scaled - rounded).abs() > 1e-9
                || !(f64::from(i8::MIN)..=f64::from(i8::MAX)).contains(&rounded)
            {
                return None;
            }
            *slot = rounded as i8;
        }
        Some(Self::from_exponents(out))
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SYMBOLS: [&str; 8] = ["m", "kg", "s", "A", "K", "mol", "cd", "rad"];
        if self.is_dimensionless() {
            return write!(f, "dimensionless");
        }
        let parts: Vec<String> = SYMBOLS
            .iter()
            .zip(self.exponents())
            .filter(|(_, e)| *e != 0)
            .map(|(symbol, e)| {
                if e == 1 {
                    symbol.to_string()
                } else {
                    format!("{symbol}^{e}")
                }
            })
            .collect();
        write!(f, "{}", parts.join("·"))
    }
}

/// A multiplicative unit: dimensions plus scale to the coherent SI unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UnitsRepr")]
pub struct Units {
    pub dimensions: Dimensions,
    pub scale: f64,
    /// Display text, usually the string the units were parsed from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Non-fatal findings from unit parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitWarning {
    /// Units were read from free text instead of an explicit dimension.
    InferredFromText { text: String },
    /// A token had more than one reading; `chosen` was used.
    Ambiguous {
        token: String,
        chosen: String,
        alternative: String,
    },
}

impl fmt::Display for UnitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitWarning::InferredFromText { text } => write!(
                f,
                "units inferred from text '{text}'; give explicit dimensions to silence this"
            ),
            UnitWarning::Ambiguous {
                token,
                chosen,
                alternative,
            } => write!(
                f,
                "'{token}' read as {chosen}, not {alternative}; write the intended unit explicitly"
            ),
        }
    }
}

/// Result of parsing a unit string.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUnits {
    pub units: Units,
    pub warnings: Vec<UnitWarning>,
}

impl Units {
    pub fn new(dimensions: Dimensions, scale: f64) -> Self {
        Self {
            dimensions,
            scale,
            label: None,
        }
    }

    pub fn dimensionless() -> Self {
        Self::new(Dimensions::DIMENSIONLESS, 1.0)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Parses a unit string, collecting warnings instead of failing on
    /// ambiguity.
    pub fn parse(text: &str) -> Result<ParsedUnits> {
        let trimmed = text.trim();
        let mut warnings = vec![UnitWarning::InferredFromText {
            text: trimmed.to_string(),
        }];
        let units = if trimmed.is_empty() {
            Units::dimensionless()
        } else {
            let tokens = tokenize(trimmed)?;
            let mut parser = UnitParser {
                text: trimmed,
                tokens,
                pos: 0,
                warnings: &mut warnings,
            };
            let units = parser.parse_product()?;
            if parser.pos != parser.tokens.len() {
                return Err(invalid(trimmed, "unexpected trailing input"));
            }
            units
        };
        if !units.scale.is_finite() || units.scale <= 0.0 {
            return Err(invalid(trimmed, "scale must be finite and positive"));
        }
        Ok(ParsedUnits {
            units: units.with_label(trimmed),
            warnings,
        })
    }

    pub fn is_dimensionless(&self) -> bool {
        self.dimensions.is_dimensionless()
    }

    pub fn is_compatible_with(&self, other: &Units) -> bool {
        self.dimensions == other.dimensions
    }

    /// Factor converting a magnitude in `self` into a magnitude in `target`.
    pub fn factor_to(&self, target: &Units) -> Result<f64> {
        if !self.is_compatible_with(target) {
            return Err(ModelError::DimensionMismatch {
                context: format!("conversion from {self} to {target}"),
                expected: target.dimensions,
                found: self.dimensions,
            });
        }
        Ok(self.scale / target.scale)
    }

    /// `None` when a dimension exponent overflows.
    pub fn multiply(&self, other: &Units) -> Option<Units> {
        let dimensions = self.dimensions.multiply(&other.dimensions)?;
        Some(Units::new(dimensions, self.scale * other.scale))
    }

    pub fn divide(&self, other: &Units) -> Option<Units> {
        let dimensions = self.dimensions.divide(&other.dimensions)?;
        Some(Units::new(dimensions, self.scale / other.scale))
    }

    pub fn power(&self, exponent: i8) -> Option<Units> {
        let dimensions = self.dimensions.power(exponent)?;
        Some(Units::new(dimensions, self.scale.powi(i32::from(exponent))))
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{label}"),
            None if self.scale == 1.0 => write!(f, "{}", self.dimensions),
            None => write!(f, "{} {}", self.scale, self.dimensions),
        }
    }
}

/// Accepts either a unit string or the structured form on deserialization.
#[derive(Deserialize)]
#[serde(untagged)]
enum UnitsRepr {
    Text(String),
    Structured {
        #[serde(default)]
        dimensions: Dimensions,
        #[serde(default = "unit_scale")]
        scale: f64,
        #[serde(default)]
        label: Option<String>,
    },
}

fn unit_scale() -> f64 {
    1.0
}

impl TryFrom<UnitsRepr> for Units {
    type Error = ModelError;

    fn try_from(repr: UnitsRepr) -> Result<Self> {
        match repr {
            UnitsRepr::Text(text) => Units::parse(&text).map(|parsed| parsed.units),
            UnitsRepr::Structured {
                dimensions,
                scale,
                label,
            } => {
                if !scale.is_finite() || scale <= 0.0 {
                    return Err(invalid(&scale.to_string(), "scale must be finite and positive"));
                }
                Ok(Units {
                    dimensions,
                    scale,
                    label,
                })
            }
        }
    }
}

fn invalid(text: &str, reason: impl Into<String>) -> ModelError {
    ModelError::InvalidUnits {
        units: text.to_string(),
        reason: reason.into(),
    }
}

// --- Unit table ---

struct UnitDef {
    /// Short symbols, eligible for short SI prefixes.
    symbols: &'static [&'static str],
    /// Long names, eligible for long SI prefixes.
    names: &'static [&'static str],
    dimensions: Dimensions,
    scale: f64,
    prefixable: bool,
}

const fn unit(
    symbols: &'static [&'static str],
    names: &'static [&'static str],
    dimensions: Dimensions,
    scale: f64,
    prefixable: bool,
) -> UnitDef {
    UnitDef {
        symbols,
        names,
        dimensions,
        scale,
        prefixable,
    }
}

const LENGTH: Dimensions = Dimensions::new(1, 0, 0, 0);
const MASS: Dimensions = Dimensions::new(0, 1, 0, 0);
const TIME: Dimensions = Dimensions::new(0, 0, 1, 0);
const CURRENT: Dimensions = Dimensions::new(0, 0, 0, 1);
const FORCE: Dimensions = Dimensions::new(1, 1, -2, 0);
const ENERGY: Dimensions = Dimensions::new(2, 1, -2, 0);
const POWER: Dimensions = Dimensions::new(2, 1, -3, 0);
const PRESSURE: Dimensions = Dimensions::new(-1, 1, -2, 0);
const CHARGE: Dimensions = Dimensions::new(0, 0, 1, 1);
const VOLTAGE: Dimensions = Dimensions::new(2, 1, -3, -1);
const RESISTANCE: Dimensions = Dimensions::new(2, 1, -3, -2);
const CONDUCTANCE: Dimensions = Dimensions::new(-2, -1, 3, 2);
const CAPACITANCE: Dimensions = Dimensions::new(-2, -1, 4, 2);
const MAGNETIC_FLUX_DENSITY: Dimensions = Dimensions::new(0, 1, -2, -1);
const FREQUENCY: Dimensions = Dimensions::new(0, 0, -1, 0);
const VOLUME: Dimensions = Dimensions::new(3, 0, 0, 0);
const TEMPERATURE: Dimensions = Dimensions {
    temperature: 1,
    ..Dimensions::DIMENSIONLESS
};
const AMOUNT: Dimensions = Dimensions {
    amount: 1,
    ..Dimensions::DIMENSIONLESS
};
const LUMINOSITY: Dimensions = Dimensions {
    luminosity: 1,
    ..Dimensions::DIMENSIONLESS
};
const ANGLE: Dimensions = Dimensions {
    angle: 1,
    ..Dimensions::DIMENSIONLESS
};
const NONE: Dimensions = Dimensions::DIMENSIONLESS;

const ELEMENTARY_CHARGE: f64 = 1.602_176_634e-19;

const UNIT_TABLE: &[UnitDef] = &[
    unit(&["m"], &["meter", "meters", "metre", "metres"], LENGTH, 1.0, true),
    unit(&["Å", "\u{212B}"], &["angstrom", "angstroms"], LENGTH, 1e-10, false),
    unit(&["g"], &["gram", "grams"], MASS, 1e-3, true),
    unit(&["amu", "Da", "u"], &["dalton", "atomic_mass_unit"], MASS, 1.660_539_066_6e-27, false),
    unit(&["s", "sec"], &["second", "seconds"], TIME, 1.0, true),
    unit(&["min"], &["minute", "minutes"], TIME, 60.0, false),
    unit(&["h", "hr"], &["hour", "hours"], TIME, 3600.0, false),
    unit(&["d"], &["day", "days"], TIME, 86_400.0, false),
    unit(&["A"], &["ampere", "amperes", "amp"], CURRENT, 1.0, true),
    unit(&["K"], &["kelvin"], TEMPERATURE, 1.0, true),
    unit(&["mol"], &["mole", "moles"], AMOUNT, 1.0, true),
    unit(&["cd"], &["candela"], LUMINOSITY, 1.0, false),
    unit(&["rad"], &["radian", "radians"], ANGLE, 1.0, false),
    unit(&["deg", "°"], &["degree", "degrees"], ANGLE, std::f64::consts::PI / 180.0, false),
    unit(&["N"], &["newton", "newtons"], FORCE, 1.0, true),
    unit(&["J"], &["joule", "joules"], ENERGY, 1.0, true),
    unit(&["eV"], &["electron_volt", "electronvolt"], ENERGY, ELEMENTARY_CHARGE, true),
    unit(&["W"], &["watt", "watts"], POWER, 1.0, true),
    unit(&["Pa"], &["pascal", "pascals"], PRESSURE, 1.0, true),
    unit(&["bar"], &[], PRESSURE, 1e5, true),
    unit(&["atm"], &["atmosphere"], PRESSURE, 101_325.0, false),
    unit(&["C"], &["coulomb", "coulombs"], CHARGE, 1.0, true),
    unit(&["V"], &["volt", "volts"], VOLTAGE, 1.0, true),
    unit(&["Ω", "ohm"], &["ohms"], RESISTANCE, 1.0, true),
    unit(&["S"], &["siemens"], CONDUCTANCE, 1.0, true),
    unit(&["F"], &["farad", "farads"], CAPACITANCE, 1.0, true),
    unit(&["T"], &["tesla"], MAGNETIC_FLUX_DENSITY, 1.0, true),
    unit(&["Hz"], &["hertz"], FREQUENCY, 1.0, true),
    unit(&["L"], &["liter", "liters", "litre", "litres"], VOLUME, 1e-3, true),
    unit(&["%"], &["percent"], NONE, 1e-2, false),
    unit(&["1"], &["dimensionless"], NONE, 1.0, false),
];

/// Short prefixes, longest first so `da` would win over `d` if added.
const PREFIXES: &[(&str, f64)] = &[
    ("Y", 1e24),
    ("Z", 1e21),
    ("E", 1e18),
    ("P", 1e15),
    ("T", 1e12),
    ("G", 1e9),
    ("M", 1e6),
    ("k", 1e3),
    ("c", 1e-2),
    ("m", 1e-3),
    ("µ", 1e-6),
    ("μ", 1e-6),
    ("u", 1e-6),
    ("n", 1e-9),
    ("p", 1e-12),
    ("f", 1e-15),
    ("a", 1e-18),
];

const LONG_PREFIXES: &[(&str, f64)] = &[
    ("yotta", 1e24),
    ("zetta", 1e21),
    ("exa", 1e18),
    ("peta", 1e15),
    ("tera", 1e12),
    ("giga", 1e9),
    ("mega", 1e6),
    ("kilo", 1e3),
    ("centi", 1e-2),
    ("milli", 1e-3),
    ("micro", 1e-6),
    ("nano", 1e-9),
    ("pico", 1e-12),
    ("femto", 1e-15),
    ("atto", 1e-18),
];

fn lookup_exact(token: &str) -> Option<&'static UnitDef> {
    UNIT_TABLE
        .iter()
        .find(|def| def.symbols.contains(&token) || def.names.contains(&token))
}

fn lookup_symbol(token: &str) -> Option<&'static UnitDef> {
    UNIT_TABLE.iter().find(|def| def.symbols.contains(&token))
}

fn lookup_prefixed(token: &str) -> Option<(Units, String)> {
    for (prefix, factor) in PREFIXES {
        if let Some(rest) = token.strip_prefix(prefix) {
            if let Some(def) = lookup_symbol(rest).filter(|def| def.prefixable) {
                let described = format!("'{prefix}' prefix on '{rest}'");
                return Some((Units::new(def.dimensions, def.scale * factor), described));
            }
        }
    }
    for (prefix, factor) in LONG_PREFIXES {
        if let Some(rest) = token.strip_prefix(prefix) {
            if let Some(def) = UNIT_TABLE
                .iter()
                .find(|def| def.prefixable && def.names.contains(&rest))
            {
                return Some((
                    Units::new(def.dimensions, def.scale * factor),
                    token.to_string(),
                ));
            }
        }
    }
    None
}

/// Another reading of `token` as two juxtaposed unit symbols.
fn juxtaposed_reading(token: &str) -> Option<String> {
    token
        .char_indices()
        .skip(1)
        .find_map(|(i, _)| {
            let (head, tail) = token.split_at(i);
            (lookup_symbol(head).is_some() && lookup_symbol(tail).is_some())
                .then(|| format!("{head}·{tail}"))
        })
}

fn resolve_token(token: &str, warnings: &mut Vec<UnitWarning>) -> Result<Units> {
    if let Some(def) = lookup_exact(token) {
        return Ok(Units::new(def.dimensions, def.scale));
    }
    let (units, described) =
        lookup_prefixed(token).ok_or_else(|| invalid(token, "unknown unit"))?;
    if let Some(alternative) = juxtaposed_reading(token) {
        warnings.push(UnitWarning::Ambiguous {
            token: token.to_string(),
            chosen: described,
            alternative,
        });
    }
    Ok(units)
}

// --- Unit expression parser ---

#[derive(Debug, Clone, PartialEq)]
enum UnitToken {
    Name(String),
    Number(f64),
    Times,
    Divide,
    Power,
    LParen,
    RParen,
}

const SUPERSCRIPTS: &[(char, char)] = &[
    ('⁰', '0'),
    ('¹', '1'),
    ('²', '2'),
    ('³', '3'),
    ('⁴', '4'),
    ('⁵', '5'),
    ('⁶', '6'),
    ('⁷', '7'),
    ('⁸', '8'),
    ('⁹', '9'),
    ('⁻', '-'),
];

fn superscript_digit(c: char) -> Option<char> {
    SUPERSCRIPTS
        .iter()
        .find(|(sup, _)| *sup == c)
        .map(|(_, plain)| *plain)
}

fn tokenize(text: &str) -> Result<Vec<UnitToken>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit()
            || c == '.'
            || (c == '-'
                && matches!(tokens.last(), Some(UnitToken::Power | UnitToken::LParen)))
        {
            let mut num = String::from(c);
            chars.next();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num
                .parse()
                .map_err(|_| invalid(text, format!("invalid number '{num}'")))?;
            tokens.push(UnitToken::Number(value));
        } else if superscript_digit(c).is_some() {
            let mut num = String::new();
            while let Some(plain) = chars.peek().copied().and_then(superscript_digit) {
                num.push(plain);
                chars.next();
            }
            let value: f64 = match num.as_str() {
                "-" => -1.0,
                _ => num
                    .parse()
                    .map_err(|_| invalid(text, format!("invalid superscript exponent '{num}'")))?,
            };
            tokens.push(UnitToken::Power);
            tokens.push(UnitToken::Number(value));
        } else if c.is_alphabetic() || matches!(c, '_' | '%' | '°' | 'Å' | 'Ω' | 'µ') {
            let mut name = String::new();
            while let Some(&d) = chars.peek() {
                if (d.is_alphanumeric() && superscript_digit(d).is_none())
                    || matches!(d, '_' | '%' | '°' | 'Å' | 'Ω' | 'µ')
                {
                    name.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(UnitToken::Name(name));
        } else {
            chars.next();
            let token = match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    UnitToken::Power
                }
                '*' | '·' | '⋅' => UnitToken::Times,
                '/' => UnitToken::Divide,
                '^' => UnitToken::Power,
                '(' => UnitToken::LParen,
                ')' => UnitToken::RParen,
                other => return Err(invalid(text, format!("unexpected character '{other}'"))),
            };
            tokens.push(token);
        }
    }
    Ok(tokens)
}

struct UnitParser<'a> {
    text: &'a str,
    tokens: Vec<UnitToken>,
    pos: usize,
    warnings: &'a mut Vec<UnitWarning>,
}

impl UnitParser<'_> {
    fn peek(&self) -> Option<&UnitToken> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<UnitToken> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_product(&mut self) -> Result<Units> {
        let mut units = self.parse_factor()?;
        loop {
            match self.peek() {
                Some(UnitToken::Times) => {
                    self.next();
                    let rhs = self.parse_factor()?;
                    units = self.checked(units.multiply(&rhs))?;
                }
                Some(UnitToken::Divide) => {
                    self.next();
                    let rhs = self.parse_factor()?;
                    units = self.checked(units.divide(&rhs))?;
                }
                // Juxtaposition: `kg m s^-2`.
                Some(UnitToken::Name(_) | UnitToken::Number(_) | UnitToken::LParen) => {
                    let rhs = self.parse_factor()?;
                    units = self.checked(units.multiply(&rhs))?;
                }
                _ => break,
            }
        }
        Ok(units)
    }

    fn checked(&self, units: Option<Units>) -> Result<Units> {
        units.ok_or_else(|| invalid(self.text, "dimension exponent out of range"))
    }

    fn parse_factor(&mut self) -> Result<Units> {
        let base = self.parse_base()?;
        if let Some(UnitToken::Power) = self.peek() {
            self.next();
            let exponent = match self.next() {
                Some(UnitToken::Number(n)) => n,
                Some(UnitToken::LParen) => {
                    let n = match self.next() {
                        Some(UnitToken::Number(n)) => n,
                        _ => return Err(invalid(self.text, "expected exponent")),
                    };
                    if self.next() != Some(UnitToken::RParen) {
                        return Err(invalid(self.text, "expected ')'"));
                    }
                    n
                }
                _ => return Err(invalid(self.text, "expected exponent")),
            };
            if exponent.fract() != 0.0 || exponent.abs() > f64::from(i8::MAX) {
                return Err(invalid(
                    self.text,
                    format!("exponent {exponent} is not a small integer"),
                ));
            }
            return self.checked(base.power(exponent as i8));
        }
        Ok(base)
    }

    fn parse_base(&mut self) -> Result<Units> {
        match self.next() {
            Some(UnitToken::Name(name)) => resolve_token(&name, self.warnings),
            Some(UnitToken::Number(n)) if n > 0.0 => Ok(Units::new(Dimensions::DIMENSIONLESS, n)),
            Some(UnitToken::LParen) => {
                let inner = self.parse_product()?;
                match self.next() {
                    Some(UnitToken::RParen) => Ok(inner),
                    _ => Err(invalid(self.text, "expected ')'")),
                }
            }
            Some(token) => Err(invalid(self.text, format!("unexpected {token:?}"))),
            None => Err(invalid(self.text, "unexpected end of input")),
        }
    }
}
