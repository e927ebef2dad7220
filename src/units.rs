//! Physical units and registry-bound quantities.
//!
//! A [`UnitRegistry`] is the symbol table that turns unit strings such as
//! `"volt"`, `"mV"` or `"meter / second"` into resolved [`Unit`]s. Every
//! registry instance carries a unique id, and every [`Quantity`] it builds is
//! bound to that id.
//!
//! Two processes never share registry instances. A quantity produced by an
//! instrument server is therefore not usable by the instrument manager until it
//! has been rebuilt from its `(magnitude, unit string)` pair in the local
//! registry; arithmetic between quantities of different registries fails with
//! [`UnitError::RegistryMismatch`] instead of silently mixing scales.
//!
//! # Supported unit expressions
//!
//! - names and symbols: `volt`, `V`, `ohm`, `Ω`
//! - SI prefixes on names and symbols: `millivolt`, `mV`, `GHz`, `µs`
//! - plural names: `volts`, `nanometers`
//! - products, quotients and integer powers: `m/s`, `meter * second`, `m**2`, `s^-1`
//!
//! Offset units (degree Celsius) and logarithmic units (dB) are not modelled.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while resolving units or combining quantities.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UnitError {
    #[error("unit [{0}] is not defined in the unit registry")]
    UndefinedUnit(String),

    #[error("cannot combine quantities from different unit registries")]
    RegistryMismatch,

    #[error("cannot convert [{from}] to [{to}]: incompatible dimensions")]
    IncompatibleUnits { from: String, to: String },

    #[error("invalid unit definition for [{name}]: {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("invalid quantity literal [{0}]")]
    InvalidQuantity(String),
}

// =============================================================================
// Dimensions
// =============================================================================

/// Exponents of the seven SI base dimensions
/// (length, mass, time, current, temperature, amount, luminosity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dimension([i8; 7]);

impl Dimension {
    /// Dimensionless.
    pub const NONE: Dimension = Dimension([0, 0, 0, 0, 0, 0, 0]);
    /// Length.
    pub const LENGTH: Dimension = Dimension([1, 0, 0, 0, 0, 0, 0]);
    /// Mass.
    pub const MASS: Dimension = Dimension([0, 1, 0, 0, 0, 0, 0]);
    /// Time.
    pub const TIME: Dimension = Dimension([0, 0, 1, 0, 0, 0, 0]);
    /// Electric current.
    pub const CURRENT: Dimension = Dimension([0, 0, 0, 1, 0, 0, 0]);
    /// Thermodynamic temperature.
    pub const TEMPERATURE: Dimension = Dimension([0, 0, 0, 0, 1, 0, 0]);
    /// Amount of substance.
    pub const AMOUNT: Dimension = Dimension([0, 0, 0, 0, 0, 1, 0]);
    /// Luminous intensity.
    pub const LUMINOSITY: Dimension = Dimension([0, 0, 0, 0, 0, 0, 1]);

    /// `self * other ** sign`; `None` when an exponent leaves the `i8` range.
    fn combine(self, other: Dimension, sign: i8) -> Option<Dimension> {
        let mut exponents = self.0;
        for (exponent, rhs) in exponents.iter_mut().zip(other.0) {
            *exponent = exponent.checked_add(rhs.checked_mul(sign)?)?;
        }
        Some(Dimension(exponents))
    }

    fn powi(self, power: i8) -> Option<Dimension> {
        let mut exponents = self.0;
        for exponent in exponents.iter_mut() {
            *exponent = exponent.checked_mul(power)?;
        }
        Some(Dimension(exponents))
    }

    /// Build a dimension from `(base, exponent)` pairs.
    fn of(parts: &[(Dimension, i8)]) -> Dimension {
        let mut exponents = [0i8; 7];
        for (base, power) in parts {
            for (exponent, b) in exponents.iter_mut().zip(base.0) {
                *exponent = exponent.saturating_add(b.saturating_mul(*power));
            }
        }
        Dimension(exponents)
    }
}

// =============================================================================
// Units
// =============================================================================

/// A resolved unit: canonical name, scale relative to SI base units, dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    name: String,
    factor: f64,
    dimension: Dimension,
}

impl Unit {
    /// Canonical name, e.g. `"millivolt"` or `"meter / second"`.
    ///
    /// This is the string that travels over the wire.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scale factor relative to the coherent SI unit of the same dimension.
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Dimension exponents.
    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// Whether values in `self` can be converted to `other`.
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.dimension == other.dimension
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone)]
struct UnitDef {
    factor: f64,
    dimension: Dimension,
}

/// SI prefixes: (name, accepted symbols, factor).
const PREFIXES: &[(&str, &[&str], f64)] = &[
    ("yotta", &["Y"], 1e24),
    ("zetta", &["Z"], 1e21),
    ("exa", &["E"], 1e18),
    ("peta", &["P"], 1e15),
    ("tera", &["T"], 1e12),
    ("giga", &["G"], 1e9),
    ("mega", &["M"], 1e6),
    ("kilo", &["k"], 1e3),
    ("hecto", &["h"], 1e2),
    ("deca", &["da"], 1e1),
    ("deci", &["d"], 1e-1),
    ("centi", &["c"], 1e-2),
    ("milli", &["m"], 1e-3),
    ("micro", &["u", "µ", "μ"], 1e-6),
    ("nano", &["n"], 1e-9),
    ("pico", &["p"], 1e-12),
    ("femto", &["f"], 1e-15),
    ("atto", &["a"], 1e-18),
];

// =============================================================================
// Registry
// =============================================================================

/// Symbol table of units with a process-unique identity.
#[derive(Debug)]
pub struct UnitRegistry {
    id: Uuid,
    units: HashMap<String, UnitDef>,
    symbols: HashMap<String, String>,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRegistry {
    /// Registry preloaded with the SI base units and the common derived units
    /// used by laboratory instruments.
    pub fn new() -> Self {
        use Dimension as D;

        let mut registry = Self::empty();
        let builtin: &[(&str, &[&str], f64, Dimension)] = &[
            ("meter", &["m"], 1.0, D::LENGTH),
            ("gram", &["g"], 1e-3, D::MASS),
            ("second", &["s"], 1.0, D::TIME),
            ("ampere", &["A"], 1.0, D::CURRENT),
            ("kelvin", &["K"], 1.0, D::TEMPERATURE),
            ("mole", &["mol"], 1.0, D::AMOUNT),
            ("candela", &["cd"], 1.0, D::LUMINOSITY),
            ("dimensionless", &[], 1.0, D::NONE),
            ("radian", &["rad"], 1.0, D::NONE),
            ("degree", &["deg"], std::f64::consts::PI / 180.0, D::NONE),
            ("minute", &["min"], 60.0, D::TIME),
            ("hour", &["h"], 3600.0, D::TIME),
            ("hertz", &["Hz"], 1.0, D::of(&[(D::TIME, -1)])),
            ("newton", &["N"], 1.0, D::of(&[(D::MASS, 1), (D::LENGTH, 1), (D::TIME, -2)])),
            ("pascal", &["Pa"], 1.0, D::of(&[(D::MASS, 1), (D::LENGTH, -1), (D::TIME, -2)])),
            ("joule", &["J"], 1.0, D::of(&[(D::MASS, 1), (D::LENGTH, 2), (D::TIME, -2)])),
            ("electron_volt", &["eV"], 1.602_176_634e-19, D::of(&[(D::MASS, 1), (D::LENGTH, 2), (D::TIME, -2)])),
            ("watt", &["W"], 1.0, D::of(&[(D::MASS, 1), (D::LENGTH, 2), (D::TIME, -3)])),
            ("coulomb", &["C"], 1.0, D::of(&[(D::TIME, 1), (D::CURRENT, 1)])),
            (
                "volt",
                &["V"],
                1.0,
                D::of(&[(D::MASS, 1), (D::LENGTH, 2), (D::TIME, -3), (D::CURRENT, -1)]),
            ),
            (
                "ohm",
                &["Ω", "Ω"],
                1.0,
                D::of(&[(D::MASS, 1), (D::LENGTH, 2), (D::TIME, -3), (D::CURRENT, -2)]),
            ),
            (
                "siemens",
                &["S"],
                1.0,
                D::of(&[(D::MASS, -1), (D::LENGTH, -2), (D::TIME, 3), (D::CURRENT, 2)]),
            ),
            (
                "farad",
                &["F"],
                1.0,
                D::of(&[(D::MASS, -1), (D::LENGTH, -2), (D::TIME, 4), (D::CURRENT, 2)]),
            ),
            (
                "henry",
                &["H"],
                1.0,
                D::of(&[(D::MASS, 1), (D::LENGTH, 2), (D::TIME, -2), (D::CURRENT, -2)]),
            ),
            ("tesla", &["T"], 1.0, D::of(&[(D::MASS, 1), (D::TIME, -2), (D::CURRENT, -1)])),
            (
                "weber",
                &["Wb"],
                1.0,
                D::of(&[(D::MASS, 1), (D::LENGTH, 2), (D::TIME, -2), (D::CURRENT, -1)]),
            ),
        ];

        for (name, symbols, factor, dimension) in builtin {
            registry.insert(name, symbols, *factor, *dimension);
        }
        registry
    }

    /// Registry with no units at all.
    pub fn empty() -> Self {
        Self {
            id: Uuid::new_v4(),
            units: HashMap::new(),
            symbols: HashMap::new(),
        }
    }

    /// Identity of this registry instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn insert(&mut self, name: &str, symbols: &[&str], factor: f64, dimension: Dimension) {
        self.units
            .insert(name.to_string(), UnitDef { factor, dimension });
        for symbol in symbols {
            self.symbols.insert((*symbol).to_string(), name.to_string());
        }
    }

    /// Define a new unit from `"<factor> <unit expression>"`, e.g.
    /// `define("furlong", "201.168 meter")`.
    pub fn define(&mut self, name: &str, definition: &str) -> Result<(), UnitError> {
        let invalid = |reason: &str| UnitError::InvalidDefinition {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() || !name.chars().all(is_identifier_char) {
            return Err(invalid("unit names may only contain letters and '_'"));
        }
        if self.units.contains_key(name) || self.symbols.contains_key(name) {
            return Err(invalid("unit is already defined"));
        }

        let definition = definition.trim();
        let (factor, expression) = match definition.split_once(char::is_whitespace) {
            Some((head, rest)) => match head.parse::<f64>() {
                Ok(factor) => (factor, rest.trim()),
                Err(_) => (1.0, definition),
            },
            None => match definition.parse::<f64>() {
                Ok(factor) => (factor, "dimensionless"),
                Err(_) => (1.0, definition),
            },
        };
        if !factor.is_finite() || factor == 0.0 {
            return Err(invalid("scale factor must be finite and non-zero"));
        }

        let base = self
            .resolve(expression)
            .map_err(|e| invalid(&e.to_string()))?;
        self.insert(name, &[], factor * base.factor, base.dimension);
        Ok(())
    }

    /// Whether `expression` resolves in this registry.
    pub fn contains(&self, expression: &str) -> bool {
        self.resolve(expression).is_ok()
    }

    /// Resolve a unit expression to a [`Unit`] with a canonical name.
    pub fn resolve(&self, expression: &str) -> Result<Unit, UnitError> {
        let undefined = || UnitError::UndefinedUnit(expression.trim().to_string());
        let tokens = tokenize(expression).ok_or_else(undefined)?;
        if tokens.is_empty() {
            return Err(undefined());
        }

        let mut factor = 1.0;
        let mut dimension = Dimension::NONE;
        let mut name = String::new();
        let mut sign: i8 = 1;
        let mut iter = tokens.into_iter().peekable();

        loop {
            let Some(Token::Ident(ident)) = iter.next() else {
                return Err(undefined());
            };
            let (canonical, def) = self.lookup(&ident).ok_or_else(undefined)?;

            let mut power: i8 = 1;
            if let Some(Token::Pow) = iter.peek() {
                iter.next();
                match iter.next() {
                    Some(Token::Int(p)) if p != 0 => power = p,
                    _ => return Err(undefined()),
                }
            }

            factor *= def.factor.powi(i32::from(sign) * i32::from(power));
            dimension = def
                .dimension
                .powi(power)
                .and_then(|d| dimension.combine(d, sign))
                .ok_or_else(undefined)?;

            if !name.is_empty() {
                name.push_str(if sign > 0 { " * " } else { " / " });
            }
            name.push_str(&canonical);
            if power != 1 {
                name.push_str(&format!(" ** {power}"));
            }

            match iter.next() {
                None => break,
                Some(Token::Mul) => sign = 1,
                Some(Token::Div) => sign = -1,
                Some(_) => return Err(undefined()),
            }
        }

        Ok(Unit {
            name,
            factor,
            dimension,
        })
    }

    /// Resolve a single identifier: exact name, symbol, prefixed name or
    /// symbol, then plural name.
    fn lookup(&self, ident: &str) -> Option<(String, UnitDef)> {
        if let Some(def) = self.units.get(ident) {
            return Some((ident.to_string(), def.clone()));
        }
        if let Some(name) = self.symbols.get(ident) {
            return self.units.get(name).map(|def| (name.clone(), def.clone()));
        }

        for (prefix, symbols, scale) in PREFIXES {
            if let Some(rest) = ident.strip_prefix(prefix) {
                if let Some(def) = self.units.get(rest) {
                    let def = UnitDef {
                        factor: def.factor * scale,
                        dimension: def.dimension,
                    };
                    return Some((format!("{prefix}{rest}"), def));
                }
            }
            for symbol in *symbols {
                let Some(rest) = ident.strip_prefix(symbol) else {
                    continue;
                };
                if let Some(name) = self.symbols.get(rest) {
                    if let Some(def) = self.units.get(name) {
                        let def = UnitDef {
                            factor: def.factor * scale,
                            dimension: def.dimension,
                        };
                        return Some((format!("{prefix}{name}"), def));
                    }
                }
            }
        }

        match ident.strip_suffix('s') {
            Some(singular) if singular.len() > 1 && !self.symbols.contains_key(ident) => {
                self.lookup(singular).filter(|(name, _)| name == singular || name.ends_with(singular))
            }
            _ => None,
        }
    }

    /// Build a quantity bound to this registry.
    pub fn quantity(&self, magnitude: f64, unit: &str) -> Result<Quantity, UnitError> {
        Ok(Quantity {
            magnitude,
            unit: self.resolve(unit)?,
            registry: self.id,
        })
    }

    /// Parse a literal such as `"1.5 V"` or `"3 meter / second"`.
    pub fn parse_quantity(&self, text: &str) -> Result<Quantity, UnitError> {
        let text = text.trim();
        let invalid = || UnitError::InvalidQuantity(text.to_string());

        if let Ok(magnitude) = text.parse::<f64>() {
            return self.quantity(magnitude, "dimensionless");
        }
        if let Some((number, unit)) = text.split_once(char::is_whitespace) {
            if let Ok(magnitude) = number.parse::<f64>() {
                return self.quantity(magnitude, unit.trim());
            }
        }

        // No separator: the longest numeric prefix ending before a letter,
        // so the exponent of `1e-3V` stays with the number.
        let (magnitude, unit) = text
            .char_indices()
            .filter(|&(i, c)| i > 0 && is_identifier_char(c))
            .filter_map(|(i, _)| text[..i].parse::<f64>().ok().map(|m| (m, &text[i..])))
            .last()
            .ok_or_else(invalid)?;
        self.quantity(magnitude, unit)
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

#[derive(Debug, PartialEq)]
enum Token {
    Ident(String),
    Int(i8),
    Mul,
    Div,
    Pow,
}

fn tokenize(expression: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if is_identifier_char(c) {
            let mut ident = String::new();
            while let Some(&c) = chars.peek() {
                if !is_identifier_char(c) {
                    break;
                }
                ident.push(c);
                chars.next();
            }
            tokens.push(Token::Ident(ident));
        } else if c == '*' {
            chars.next();
            if chars.peek() == Some(&'*') {
                chars.next();
                tokens.push(Token::Pow);
            } else {
                tokens.push(Token::Mul);
            }
        } else if c == '^' {
            chars.next();
            tokens.push(Token::Pow);
        } else if c == '/' {
            chars.next();
            tokens.push(Token::Div);
        } else if c == '-' || c.is_ascii_digit() {
            let mut digits = String::new();
            digits.push(c);
            chars.next();
            while let Some(&c) = chars.peek() {
                if !c.is_ascii_digit() {
                    break;
                }
                digits.push(c);
                chars.next();
            }
            tokens.push(Token::Int(digits.parse().ok()?));
        } else {
            return None;
        }
    }
    Some(tokens)
}

// =============================================================================
// Quantities
// =============================================================================

/// A magnitude with a unit, bound to the registry that built it.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    magnitude: f64,
    unit: Unit,
    registry: Uuid,
}

impl Quantity {
    /// Numeric magnitude in [`Quantity::unit`].
    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    /// The resolved unit.
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Id of the registry this quantity belongs to.
    pub fn registry_id(&self) -> Uuid {
        self.registry
    }

    /// Whether this quantity was built by `registry`.
    pub fn belongs_to(&self, registry: &UnitRegistry) -> bool {
        self.registry == registry.id
    }

    /// Convert to `unit`, resolved in `registry` (which must be the one that
    /// built `self`).
    pub fn to(&self, registry: &UnitRegistry, unit: &str) -> Result<Quantity, UnitError> {
        if !self.belongs_to(registry) {
            return Err(UnitError::RegistryMismatch);
        }
        let target = registry.resolve(unit)?;
        self.convert(&target)
    }

    fn convert(&self, target: &Unit) -> Result<Quantity, UnitError> {
        if !self.unit.is_compatible(target) {
            return Err(UnitError::IncompatibleUnits {
                from: self.unit.name.clone(),
                to: target.name.clone(),
            });
        }
        Ok(Quantity {
            magnitude: self.magnitude * self.unit.factor / target.factor,
            unit: target.clone(),
            registry: self.registry,
        })
    }

    /// `self + other`, expressed in the unit of `self`.
    pub fn checked_add(&self, other: &Quantity) -> Result<Quantity, UnitError> {
        let other = self.align(other)?;
        Ok(Quantity {
            magnitude: self.magnitude + other.magnitude,
            ..self.clone()
        })
    }

    /// `self - other`, expressed in the unit of `self`.
    pub fn checked_sub(&self, other: &Quantity) -> Result<Quantity, UnitError> {
        let other = self.align(other)?;
        Ok(Quantity {
            magnitude: self.magnitude - other.magnitude,
            ..self.clone()
        })
    }

    /// Multiply the magnitude by a plain number.
    pub fn scaled(&self, factor: f64) -> Quantity {
        Quantity {
            magnitude: self.magnitude * factor,
            ..self.clone()
        }
    }

    fn align(&self, other: &Quantity) -> Result<Quantity, UnitError> {
        if self.registry != other.registry {
            return Err(UnitError::RegistryMismatch);
        }
        other.convert(&self.unit)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.magnitude, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn resolves_names_symbols_and_prefixes() {
        let units = UnitRegistry::new();

        assert_eq!(units.resolve("volt").unwrap().name(), "volt");
        assert_eq!(units.resolve("V").unwrap().name(), "volt");
        assert_eq!(units.resolve("mV").unwrap().name(), "millivolt");
        assert_eq!(units.resolve("millivolt").unwrap().name(), "millivolt");
        assert_eq!(units.resolve("GHz").unwrap().name(), "gigahertz");
        assert_eq!(units.resolve("nanometers").unwrap().name(), "nanometer");
        assert_eq!(units.resolve("min").unwrap().name(), "minute");
        assert_eq!(units.resolve("kg").unwrap().name(), "kilogram");
        assert!(approx(units.resolve("kg").unwrap().factor(), 1.0));
        assert!(approx(units.resolve("µs").unwrap().factor(), 1e-6));
    }

    #[test]
    fn resolves_compound_expressions() {
        let units = UnitRegistry::new();

        let speed = units.resolve("m/s").unwrap();
        assert_eq!(speed.name(), "meter / second");
        assert_eq!(
            speed.dimension(),
            Dimension::of(&[(Dimension::LENGTH, 1), (Dimension::TIME, -1)])
        );

        let area = units.resolve("mm**2").unwrap();
        assert_eq!(area.name(), "millimeter ** 2");
        assert!(approx(area.factor(), 1e-6));

        assert!(units
            .resolve("watt / second")
            .unwrap()
            .is_compatible(&units.resolve("J / s ** 2").unwrap()));
    }

    #[test]
    fn unknown_units_fail() {
        let units = UnitRegistry::new();
        assert_eq!(
            units.resolve("furlong"),
            Err(UnitError::UndefinedUnit("furlong".to_string()))
        );
        assert!(units.resolve("").is_err());
        assert!(units.resolve("m / / s").is_err());
        assert!(units.resolve("volt$").is_err());
    }

    #[test]
    fn exponent_overflow_is_undefined() {
        let units = UnitRegistry::new();
        assert_eq!(
            units.resolve("joule ** 100"),
            Err(UnitError::UndefinedUnit("joule ** 100".to_string()))
        );
        assert!(units.resolve("m ** 100 * m ** 100").is_err());
        assert!(units.resolve("m ** 1000").is_err());
        assert!(units.resolve("m / s ** -128").is_err());
        assert_eq!(units.resolve("m ** 127").unwrap().dimension().0[0], 127);
    }

    #[test]
    fn custom_definitions_resolve() {
        let mut units = UnitRegistry::new();
        units.define("furlong", "201.168 meter").unwrap();

        let furlong = units.quantity(1.0, "furlong").unwrap();
        let meters = furlong.to(&units, "m").unwrap();
        assert!(approx(meters.magnitude(), 201.168));

        assert!(units.define("furlong", "1 meter").is_err());
        assert!(units.define("bogus", "3 parsec").is_err());
        assert!(units.define("two words", "1 m").is_err());
    }

    #[test]
    fn same_registry_quantities_add() {
        let units = UnitRegistry::new();
        let a = units.quantity(1.0, "volt").unwrap();
        let b = units.quantity(5.0, "volt").unwrap();

        let sum = a.checked_add(&b).unwrap();
        assert_eq!(sum.magnitude(), 6.0);
        assert_eq!(sum.unit().name(), "volt");

        let mixed = units
            .quantity(500.0, "mV")
            .unwrap()
            .checked_add(&units.quantity(1.0, "V").unwrap())
            .unwrap();
        assert!(approx(mixed.magnitude(), 1500.0));
        assert_eq!(mixed.unit().name(), "millivolt");
    }

    #[test]
    fn foreign_registry_quantities_do_not_mix() {
        let local = UnitRegistry::new();
        let remote = UnitRegistry::new();
        assert_ne!(local.id(), remote.id());

        let a = local.quantity(1.0, "volt").unwrap();
        let b = remote.quantity(5.0, "volt").unwrap();
        assert_eq!(a.checked_add(&b), Err(UnitError::RegistryMismatch));
        assert_eq!(b.to(&local, "mV"), Err(UnitError::RegistryMismatch));
    }

    #[test]
    fn incompatible_dimensions_fail() {
        let units = UnitRegistry::new();
        let volts = units.quantity(1.0, "V").unwrap();
        let amps = units.quantity(1.0, "A").unwrap();
        assert!(matches!(
            volts.checked_sub(&amps),
            Err(UnitError::IncompatibleUnits { .. })
        ));
    }

    #[test]
    fn parses_quantity_literals() {
        let units = UnitRegistry::new();

        let q = units.parse_quantity("1.5 V").unwrap();
        assert_eq!(q.magnitude(), 1.5);
        assert_eq!(q.unit().name(), "volt");

        let q = units.parse_quantity("250mW").unwrap();
        assert_eq!(q.magnitude(), 250.0);
        assert_eq!(q.unit().name(), "milliwatt");

        let q = units.parse_quantity("-3e2 meter / second").unwrap();
        assert_eq!(q.magnitude(), -300.0);

        let q = units.parse_quantity("1e-3V").unwrap();
        assert!(approx(q.magnitude(), 1e-3));
        assert_eq!(q.unit().name(), "volt");

        let q = units.parse_quantity("42").unwrap();
        assert_eq!(q.unit().name(), "dimensionless");

        assert!(matches!(
            units.parse_quantity("volt"),
            Err(UnitError::InvalidQuantity(_))
        ));
    }
}
