//! Compiled module representation
//!
//! A [`ModuleDef`] is the unit the weaver reads, rewrites and writes back. It
//! mirrors the subset of managed metadata the injection pipeline needs: type
//! definitions with their custom attributes, fields and methods, and method
//! bodies as a flat list of stack-machine [`Instruction`]s.
//!
//! Images live on disk as JSON, optionally paired with a debug symbol sidecar
//! (`<image>.sym.json`) that must be rewritten together with the module.
//!
//! # Example
//!
//! ```rust
//! use tree_injector::metadata::{FieldDef, ModuleDef, TypeDef, TypeRef};
//! use tree_injector::attributes;
//!
//! let module = ModuleDef::new("Game").with_type(
//!     TypeDef::class("Game.Player")
//!         .with_field(
//!             FieldDef::new("movement", TypeRef::new("Game", "Game.IMovement"))
//!                 .with_attribute(attributes::needs(false)),
//!         ),
//! );
//!
//! assert!(module.find_type("Game.Player").is_some());
//! ```

use crate::error::WeaveError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

// =============================================================================
// References
// =============================================================================

/// Reference to a type, possibly defined in another module.
///
/// Two references are equal when their full names and scopes match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    /// Name of the module defining the type
    pub scope: String,
    /// Namespace-qualified name, nested types separated by `/`
    pub name: String,
    /// Generic arguments of a closed generic instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_args: Vec<TypeRef>,
    /// Whether this is an unbound generic parameter (`T`)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_generic_parameter: bool,
}

impl TypeRef {
    /// Reference a non-generic type
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
            generic_args: Vec::new(),
            is_generic_parameter: false,
        }
    }

    /// Reference a closed generic type
    pub fn generic(scope: impl Into<String>, name: impl Into<String>, args: Vec<TypeRef>) -> Self {
        Self {
            generic_args: args,
            ..Self::new(scope, name)
        }
    }

    /// Reference an unbound generic parameter
    pub fn parameter(name: impl Into<String>) -> Self {
        Self {
            is_generic_parameter: true,
            ..Self::new("", name)
        }
    }

    /// Full name including generic arguments (`Ns.Type<Ns.Arg>`)
    pub fn full_name(&self) -> String {
        if self.generic_args.is_empty() {
            return self.name.clone();
        }
        let args: Vec<String> = self.generic_args.iter().map(TypeRef::full_name).collect();
        format!("{}<{}>", self.name, args.join(","))
    }

    /// Whether the reference mentions an unbound generic parameter anywhere
    pub fn is_open(&self) -> bool {
        self.is_generic_parameter || self.generic_args.iter().any(TypeRef::is_open)
    }

    /// Whether the reference denotes an array type
    pub fn is_array(&self) -> bool {
        self.name.ends_with("[]")
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// Reference to a method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRef {
    pub declaring_type: TypeRef,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_args: Vec<TypeRef>,
    #[serde(default)]
    pub has_this: bool,
}

impl MethodRef {
    /// Reference an instance method
    pub fn instance(declaring_type: TypeRef, name: impl Into<String>) -> Self {
        Self {
            declaring_type,
            name: name.into(),
            generic_args: Vec::new(),
            has_this: true,
        }
    }

    /// Reference a static method, optionally generic
    pub fn static_method(
        declaring_type: TypeRef,
        name: impl Into<String>,
        generic_args: Vec<TypeRef>,
    ) -> Self {
        Self {
            declaring_type,
            name: name.into(),
            generic_args,
            has_this: false,
        }
    }

    /// Whether this references an instance constructor
    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR
    }
}

/// Reference to a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub declaring_type: TypeRef,
    pub name: String,
    pub field_type: TypeRef,
}

// =============================================================================
// Custom attributes
// =============================================================================

/// Constructor argument of a custom attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttributeArgument {
    Type(TypeRef),
    Bool(bool),
    Int(i64),
    String(String),
}

/// Custom attribute applied to a module, type or field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAttribute {
    pub attribute_type: TypeRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<AttributeArgument>,
}

impl CustomAttribute {
    /// Create an attribute without arguments
    pub fn new(attribute_type: TypeRef) -> Self {
        Self {
            attribute_type,
            arguments: Vec::new(),
        }
    }

    /// Append a constructor argument
    pub fn with_argument(mut self, argument: AttributeArgument) -> Self {
        self.arguments.push(argument);
        self
    }

    /// Whether the attribute type has the given full name
    #[inline]
    pub fn is(&self, full_name: &str) -> bool {
        self.attribute_type.name == full_name
    }
}

// =============================================================================
// Definitions
// =============================================================================

/// Name of instance constructors
pub const CONSTRUCTOR: &str = ".ctor";
/// Name of static constructors
pub const STATIC_CONSTRUCTOR: &str = ".cctor";

/// Kind of a type definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    #[default]
    Class,
    Interface,
    ValueType,
    Primitive,
    Array,
}

/// Member accessibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Family,
    Assembly,
    Private,
}

/// Type definition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TypeDef {
    /// Namespace-qualified name
    pub name: String,
    #[serde(default)]
    pub kind: TypeKind,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type: Option<TypeRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<TypeRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<CustomAttribute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    /// Define a class
    pub fn class(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Class,
            ..Self::default()
        }
    }

    /// Define an interface
    pub fn interface(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Interface,
            is_abstract: true,
            ..Self::default()
        }
    }

    /// Define a value type
    pub fn value_type(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::ValueType,
            ..Self::default()
        }
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn with_generic_parameter(mut self, name: impl Into<String>) -> Self {
        self.generic_parameters.push(name.into());
        self
    }

    pub fn with_base(mut self, base: TypeRef) -> Self {
        self.base_type = Some(base);
        self
    }

    pub fn implementing(mut self, interface: TypeRef) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_attribute(mut self, attribute: CustomAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Reference this type from the given module scope
    pub fn reference(&self, scope: &str) -> TypeRef {
        TypeRef::new(scope, self.name.clone())
    }

    /// A concrete, instantiable class
    pub fn is_concrete_class(&self) -> bool {
        self.kind == TypeKind::Class && !self.is_abstract && self.generic_parameters.is_empty()
    }

    pub fn has_attribute(&self, full_name: &str) -> bool {
        self.attributes.iter().any(|a| a.is(full_name))
    }

    pub fn has_interface(&self, full_name: &str) -> bool {
        self.interfaces.iter().any(|i| i.name == full_name)
    }

    pub fn find_method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// The parameterless instance constructor, if any
    pub fn default_constructor(&self) -> Option<&MethodDef> {
        self.methods
            .iter()
            .find(|m| m.is_constructor() && m.parameters.is_empty())
    }
}

/// Field definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: TypeRef,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<CustomAttribute>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: TypeRef) -> Self {
        Self {
            name: name.into(),
            field_type,
            is_static: false,
            attributes: Vec::new(),
        }
    }

    pub fn static_field(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn with_attribute(mut self, attribute: CustomAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }
}

/// Method definition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub is_new_slot: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TypeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<TypeRef>,
    /// Interface methods this method explicitly implements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<MethodRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<Instruction>>,
}

impl MethodDef {
    /// Define a public instance method with an empty body
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: Some(vec![Instruction::Ret]),
            ..Self::default()
        }
    }

    /// Define an instance constructor
    pub fn constructor(parameters: Vec<TypeRef>, body: Vec<Instruction>) -> Self {
        Self {
            name: CONSTRUCTOR.into(),
            parameters,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_body(mut self, body: Vec<Instruction>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR && !self.is_static
    }

    pub fn instructions(&self) -> &[Instruction] {
        self.body.as_deref().unwrap_or(&[])
    }
}

/// Stack-machine instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "operand", rename_all = "snake_case")]
pub enum Instruction {
    Nop,
    /// Push `this`
    LdArg0,
    LdcI4(i32),
    LdStr(String),
    Call(MethodRef),
    CallVirt(MethodRef),
    NewObj(MethodRef),
    LdFld(FieldRef),
    StFld(FieldRef),
    StSFld(FieldRef),
    Pop,
    Dup,
    Ret,
    NewArr(TypeRef),
    LdToken(TypeRef),
    StElemRef,
    /// Opcode the pipeline never inspects
    Other(String),
}

impl Instruction {
    /// The called method, for `Call` and `CallVirt`
    pub fn called_method(&self) -> Option<&MethodRef> {
        match self {
            Self::Call(method) | Self::CallVirt(method) => Some(method),
            _ => None,
        }
    }
}

// =============================================================================
// Modules
// =============================================================================

/// A compiled module: the unit of weaving
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<CustomAttribute>,
    #[serde(default)]
    pub types: Vec<TypeDef>,
}

impl ModuleDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, type_def: TypeDef) -> Self {
        self.types.push(type_def);
        self
    }

    pub fn find_type(&self, name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn find_type_mut(&mut self, name: &str) -> Option<&mut TypeDef> {
        self.types.iter_mut().find(|t| t.name == name)
    }

    /// Whether the reference points at a type defined in this module
    pub fn defines(&self, type_ref: &TypeRef) -> bool {
        type_ref.scope == self.name && self.find_type(&type_ref.name).is_some()
    }

    pub fn has_attribute(&self, full_name: &str) -> bool {
        self.attributes.iter().any(|a| a.is(full_name))
    }
}

// =============================================================================
// Images on disk
// =============================================================================

/// Source position of an instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePoint {
    pub offset: usize,
    pub document: String,
    pub line: u32,
}

/// Debug symbols paired with a module image, keyed by `Type::method`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebugSymbols {
    pub module: String,
    #[serde(default)]
    pub methods: BTreeMap<String, Vec<SequencePoint>>,
}

/// A module image file and its optional debug symbol sidecar
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleImage {
    pub module: ModuleDef,
    pub symbols: Option<DebugSymbols>,
}

impl ModuleImage {
    /// Path of the symbol sidecar for a module image
    pub fn symbols_path(path: &Path) -> PathBuf {
        path.with_extension("sym.json")
    }

    /// Read a module image, along with its symbols when present
    pub fn read(path: impl AsRef<Path>) -> Result<Self, WeaveError> {
        let path = path.as_ref();
        let module: ModuleDef = serde_json::from_slice(&fs::read(path)?)?;

        let symbols_path = Self::symbols_path(path);
        let symbols = if symbols_path.exists() {
            Some(serde_json::from_slice(&fs::read(&symbols_path)?)?)
        } else {
            None
        };

        Ok(Self { module, symbols })
    }

    /// Write the module image and its symbols in place
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), WeaveError> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_vec_pretty(&self.module)?)?;

        if let Some(symbols) = &self.symbols {
            let symbols = DebugSymbols {
                module: self.module.name.clone(),
                methods: symbols.methods.clone(),
            };
            fs::write(Self::symbols_path(path), serde_json::to_vec_pretty(&symbols)?)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name_with_generics() {
        let list = TypeRef::generic(
            "System",
            "System.List",
            vec![TypeRef::generic(
                "System",
                "System.Nullable",
                vec![TypeRef::new("System", "System.Int32")],
            )],
        );
        assert_eq!(list.full_name(), "System.List<System.Nullable<System.Int32>>");
        assert!(!list.is_open());
        assert!(TypeRef::generic("System", "System.List", vec![TypeRef::parameter("T")]).is_open());
    }

    #[test]
    fn test_equality_includes_scope() {
        assert_ne!(TypeRef::new("A", "Game.Player"), TypeRef::new("B", "Game.Player"));
        assert_eq!(TypeRef::new("A", "Game.Player"), TypeRef::new("A", "Game.Player"));
    }

    #[test]
    fn test_default_constructor_lookup() {
        let ty = TypeDef::class("Game.Player")
            .with_method(MethodDef::constructor(
                vec![TypeRef::new("System", "System.Int32")],
                vec![Instruction::Ret],
            ))
            .with_method(MethodDef::constructor(vec![], vec![Instruction::Ret]));

        let ctor = ty.default_constructor().expect("parameterless constructor");
        assert!(ctor.parameters.is_empty());
    }

    #[test]
    fn test_instruction_serialization_shape() {
        let json = serde_json::to_string(&Instruction::LdcI4(1)).unwrap();
        assert_eq!(json, r#"{"op":"ldc_i4","operand":1}"#);
        let json = serde_json::to_string(&Instruction::Ret).unwrap();
        assert_eq!(json, r#"{"op":"ret"}"#);
    }

    #[test]
    fn test_image_round_trips_with_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Game.module.json");

        let image = ModuleImage {
            module: ModuleDef::new("Game").with_type(TypeDef::class("Game.Player")),
            symbols: Some(DebugSymbols {
                module: "Game".into(),
                methods: BTreeMap::from([(
                    "Game.Player::.ctor".to_string(),
                    vec![SequencePoint {
                        offset: 0,
                        document: "Player.cs".into(),
                        line: 12,
                    }],
                )]),
            }),
        };

        image.write(&path).unwrap();
        assert!(ModuleImage::symbols_path(&path).exists());

        let read = ModuleImage::read(&path).unwrap();
        assert_eq!(read, image);
    }
}
