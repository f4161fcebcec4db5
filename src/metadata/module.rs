//! In-memory host module.
//!
//! [`Module`] is the managed module the devirtualizer operates on: it enumerates methods and their
//! bodies, resolves tokens to names, imports new type and member references for operands that point
//! outside the module, and accepts replacement bodies for translated methods. Loading it from and
//! writing it back to a PE image is left to a metadata library.

use std::collections::{HashMap, HashSet};

use crate::{
    metadata::{
        method::{MethodAttributes, MethodBody, MethodDef, MethodSig},
        token::{TableId, Token},
    },
    Error, Result,
};

/// A type definition.
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// `TypeDef` token
    pub token: Token,
    /// Namespace, may be empty
    pub namespace: String,
    /// Type name
    pub name: String,
    /// Fields in declaration order
    pub fields: Vec<Token>,
    /// Methods in declaration order
    pub methods: Vec<Token>,
}

/// A reference to a type defined in another assembly.
#[derive(Debug, Clone)]
pub struct TypeRef {
    /// `TypeRef` token
    pub token: Token,
    /// Namespace, may be empty
    pub namespace: String,
    /// Type name
    pub name: String,
    /// Name of the assembly the type lives in
    pub scope: String,
}

/// A generic type instantiation.
#[derive(Debug, Clone)]
pub struct TypeSpec {
    /// `TypeSpec` token
    pub token: Token,
    /// Open generic type
    pub generic_type: Token,
    /// Type arguments
    pub arguments: Vec<Token>,
}

/// A field definition.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// `Field` token
    pub token: Token,
    /// Field name
    pub name: String,
    /// Owning `TypeDef`
    pub declaring_type: Token,
    /// Field type, null when unknown
    pub field_type: Token,
    /// Static field
    pub is_static: bool,
}

/// Signature of a member reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRefSig {
    /// Method reference
    Method(MethodSig),
    /// Field reference with its type, null when unknown
    Field(Token),
}

/// A reference to a field or method of a type outside this module.
#[derive(Debug, Clone)]
pub struct MemberRef {
    /// `MemberRef` token
    pub token: Token,
    /// Referenced type
    pub parent: Token,
    /// Member name
    pub name: String,
    /// Member signature
    pub signature: MemberRefSig,
}

/// A generic method instantiation.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    /// `MethodSpec` token
    pub token: Token,
    /// Open generic method
    pub method: Token,
    /// Method type arguments
    pub arguments: Vec<Token>,
}

/// Splits `Namespace.Name, Assembly` into its three parts.
fn split_type_name(full_name: &str) -> (&str, &str, &str) {
    let (name, scope) = match full_name.split_once(',') {
        Some((name, scope)) => (name.trim(), scope.trim()),
        None => (full_name.trim(), ""),
    };
    match name.rsplit_once('.') {
        Some((namespace, name)) => (namespace, name, scope),
        None => ("", name, scope),
    }
}

fn join_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

/// A loaded managed module.
///
/// # Examples
///
/// ```rust
/// use dotdevirt::metadata::{method::{MethodAttributes, MethodSig}, module::Module};
///
/// let mut module = Module::new("Sample.dll");
/// let program = module.add_type("Sample", "Program");
/// let main = module.add_method(program, "Main", MethodAttributes::STATIC, MethodSig::default(), None);
///
/// assert_eq!(module.member_name(main).as_deref(), Some("Sample.Program::Main"));
/// assert_eq!(module.find_type("Sample.Program"), Some(program));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Module name
    pub name: String,
    types: Vec<TypeDef>,
    type_refs: Vec<TypeRef>,
    type_specs: Vec<TypeSpec>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
    omitted: HashSet<Token>,
    member_refs: Vec<MemberRef>,
    method_specs: Vec<MethodSpec>,
    user_strings: Vec<String>,
    resources: HashMap<String, Vec<u8>>,
}

fn row_of<T>(rows: &[T], token: Token, table: TableId) -> Option<&T> {
    if token.table_id() != Some(table) || token.row() == 0 {
        return None;
    }
    rows.get(token.row() as usize - 1)
}

fn next_token(len: usize, table: TableId) -> Token {
    Token::from_parts(table, len as u32 + 1)
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Adds a type definition.
    pub fn add_type(&mut self, namespace: &str, name: &str) -> Token {
        let token = next_token(self.types.len(), TableId::TypeDef);
        self.types.push(TypeDef {
            token,
            namespace: namespace.to_string(),
            name: name.to_string(),
            fields: Vec::new(),
            methods: Vec::new(),
        });
        token
    }

    /// Adds a type reference.
    pub fn add_type_ref(&mut self, namespace: &str, name: &str, scope: &str) -> Token {
        let token = next_token(self.type_refs.len(), TableId::TypeRef);
        self.type_refs.push(TypeRef {
            token,
            namespace: namespace.to_string(),
            name: name.to_string(),
            scope: scope.to_string(),
        });
        token
    }

    /// Adds a field to `owner`.
    pub fn add_field(
        &mut self,
        owner: Token,
        name: &str,
        field_type: Token,
        is_static: bool,
    ) -> Token {
        let token = next_token(self.fields.len(), TableId::Field);
        self.fields.push(FieldDef {
            token,
            name: name.to_string(),
            declaring_type: owner,
            field_type,
            is_static,
        });
        if let Some(ty) = self.type_def_mut(owner) {
            ty.fields.push(token);
        }
        token
    }

    /// Adds a method to `owner`.
    pub fn add_method(
        &mut self,
        owner: Token,
        name: &str,
        flags: MethodAttributes,
        signature: MethodSig,
        body: Option<MethodBody>,
    ) -> Token {
        let token = next_token(self.methods.len(), TableId::MethodDef);
        self.methods.push(MethodDef {
            token,
            name: name.to_string(),
            declaring_type: owner,
            flags,
            signature,
            body,
        });
        if let Some(ty) = self.type_def_mut(owner) {
            ty.methods.push(token);
        }
        token
    }

    /// Adds a member reference.
    pub fn add_member_ref(&mut self, parent: Token, name: &str, signature: MemberRefSig) -> Token {
        let token = next_token(self.member_refs.len(), TableId::MemberRef);
        self.member_refs.push(MemberRef {
            token,
            parent,
            name: name.to_string(),
            signature,
        });
        token
    }

    /// Returns the token of `value` in the user string heap, appending it if absent.
    pub fn add_user_string(&mut self, value: &str) -> Token {
        if let Some(index) = self.user_strings.iter().position(|s| s == value) {
            return Token::from_parts(TableId::UserString, index as u32 + 1);
        }
        self.user_strings.push(value.to_string());
        next_token(self.user_strings.len() - 1, TableId::UserString)
    }

    /// Adds or replaces a manifest resource.
    pub fn add_resource(&mut self, name: &str, data: Vec<u8>) {
        self.resources.insert(name.to_string(), data);
    }

    /// Returns the type definition for `token`.
    #[must_use]
    pub fn type_def(&self, token: Token) -> Option<&TypeDef> {
        row_of(&self.types, token, TableId::TypeDef)
    }

    fn type_def_mut(&mut self, token: Token) -> Option<&mut TypeDef> {
        if token.table_id() != Some(TableId::TypeDef) || token.row() == 0 {
            return None;
        }
        self.types.get_mut(token.row() as usize - 1)
    }

    /// Returns the type reference for `token`.
    #[must_use]
    pub fn type_ref(&self, token: Token) -> Option<&TypeRef> {
        row_of(&self.type_refs, token, TableId::TypeRef)
    }

    /// Returns the field definition for `token`.
    #[must_use]
    pub fn field(&self, token: Token) -> Option<&FieldDef> {
        row_of(&self.fields, token, TableId::Field)
    }

    /// Returns the method definition for `token`.
    #[must_use]
    pub fn method(&self, token: Token) -> Option<&MethodDef> {
        row_of(&self.methods, token, TableId::MethodDef)
            .filter(|method| !self.omitted.contains(&method.token))
    }

    /// Returns the member reference for `token`.
    #[must_use]
    pub fn member_ref(&self, token: Token) -> Option<&MemberRef> {
        row_of(&self.member_refs, token, TableId::MemberRef)
    }

    /// Returns the user string for `token`.
    #[must_use]
    pub fn user_string(&self, token: Token) -> Option<&str> {
        row_of(&self.user_strings, token, TableId::UserString).map(String::as_str)
    }

    /// Returns the data of the manifest resource `name`.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&[u8]> {
        self.resources.get(name).map(Vec::as_slice)
    }

    /// Iterates all type definitions in token order.
    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.iter()
    }

    /// Iterates all method definitions in token order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.methods.iter().filter(|m| !self.omitted.contains(&m.token))
    }

    /// Returns `true` if `token` names an existing row.
    #[must_use]
    pub fn contains(&self, token: Token) -> bool {
        match token.table_id() {
            Some(TableId::TypeDef) => self.type_def(token).is_some(),
            Some(TableId::TypeRef) => self.type_ref(token).is_some(),
            Some(TableId::TypeSpec) => row_of(&self.type_specs, token, TableId::TypeSpec).is_some(),
            Some(TableId::Field) => self.field(token).is_some(),
            Some(TableId::MethodDef) => self.method(token).is_some(),
            Some(TableId::MemberRef) => self.member_ref(token).is_some(),
            Some(TableId::MethodSpec) => {
                row_of(&self.method_specs, token, TableId::MethodSpec).is_some()
            }
            Some(TableId::UserString) => self.user_string(token).is_some(),
            None => false,
        }
    }

    /// Full name of a type token, e.g. `System.String`.
    #[must_use]
    pub fn type_name(&self, token: Token) -> Option<String> {
        match token.table_id()? {
            TableId::TypeDef => self
                .type_def(token)
                .map(|ty| join_name(&ty.namespace, &ty.name)),
            TableId::TypeRef => self
                .type_ref(token)
                .map(|ty| join_name(&ty.namespace, &ty.name)),
            TableId::TypeSpec => {
                let spec = row_of(&self.type_specs, token, TableId::TypeSpec)?;
                let base = self.type_name(spec.generic_type)?;
                let args: Vec<String> = spec
                    .arguments
                    .iter()
                    .map(|arg| self.type_name(*arg).unwrap_or_else(|| arg.to_string()))
                    .collect();
                Some(format!("{base}<{}>", args.join(",")))
            }
            _ => None,
        }
    }

    /// Owning type of a field, method or member reference.
    #[must_use]
    pub fn declaring_type(&self, token: Token) -> Option<Token> {
        match token.table_id()? {
            TableId::Field => self.field(token).map(|f| f.declaring_type),
            TableId::MethodDef => self.method(token).map(|m| m.declaring_type),
            TableId::MemberRef => self.member_ref(token).map(|m| m.parent),
            TableId::MethodSpec => {
                let spec = row_of(&self.method_specs, token, TableId::MethodSpec)?;
                self.declaring_type(spec.method)
            }
            _ => None,
        }
    }

    /// Full member name, e.g. `System.Reflection.Module::ResolveString`.
    #[must_use]
    pub fn member_name(&self, token: Token) -> Option<String> {
        let name = match token.table_id()? {
            TableId::Field => self.field(token)?.name.clone(),
            TableId::MethodDef => self.method(token)?.name.clone(),
            TableId::MemberRef => self.member_ref(token)?.name.clone(),
            TableId::MethodSpec => {
                let spec = row_of(&self.method_specs, token, TableId::MethodSpec)?;
                return self.member_name(spec.method);
            }
            _ => return None,
        };
        let owner = self.type_name(self.declaring_type(token)?)?;
        Some(format!("{owner}::{name}"))
    }

    /// Signature of a callable token (method definition, method reference or instantiation).
    #[must_use]
    pub fn method_sig(&self, token: Token) -> Option<&MethodSig> {
        match token.table_id()? {
            TableId::MethodDef => self.method(token).map(|m| &m.signature),
            TableId::MemberRef => match &self.member_ref(token)?.signature {
                MemberRefSig::Method(sig) => Some(sig),
                MemberRefSig::Field(_) => None,
            },
            TableId::MethodSpec => {
                let spec = row_of(&self.method_specs, token, TableId::MethodSpec)?;
                self.method_sig(spec.method)
            }
            _ => None,
        }
    }

    /// Finds a type definition or reference by full name.
    #[must_use]
    pub fn find_type(&self, full_name: &str) -> Option<Token> {
        let (namespace, name, scope) = split_type_name(full_name);
        if let Some(ty) = self
            .types
            .iter()
            .find(|ty| ty.namespace == namespace && ty.name == name)
        {
            return Some(ty.token);
        }
        self.type_refs
            .iter()
            .find(|ty| {
                ty.namespace == namespace && ty.name == name && (scope.is_empty() || ty.scope == scope)
            })
            .map(|ty| ty.token)
    }

    /// Finds a method of `owner` by name and, when given, parameter types.
    #[must_use]
    pub fn find_method(&self, owner: Token, name: &str, params: Option<&[Token]>) -> Option<Token> {
        let ty = self.type_def(owner)?;
        ty.methods.iter().copied().find(|token| {
            self.method(*token).is_some_and(|m| {
                m.name == name && params.map_or(true, |p| m.signature.params.as_slice() == p)
            })
        })
    }

    /// Finds a field of `owner` by name.
    #[must_use]
    pub fn find_field(&self, owner: Token, name: &str) -> Option<Token> {
        let ty = self.type_def(owner)?;
        ty.fields
            .iter()
            .copied()
            .find(|token| self.field(*token).is_some_and(|f| f.name == name))
    }

    /// Returns a token for the type `full_name` (`Namespace.Name[, Assembly]`), adding a type
    /// reference when neither a definition nor a reference exists yet.
    pub fn import_type(&mut self, full_name: &str) -> Token {
        if let Some(token) = self.find_type(full_name) {
            return token;
        }
        let (namespace, name, scope) = split_type_name(full_name);
        let (namespace, name, scope) = (namespace.to_string(), name.to_string(), scope.to_string());
        self.add_type_ref(&namespace, &name, &scope)
    }

    /// Returns a token for the managed reference type `element&`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenNotFound`] if `element` does not name a type.
    pub fn import_by_ref_type(&mut self, element: Token) -> Result<Token> {
        let name = self.type_name(element).ok_or(Error::TokenNotFound(element))?;
        Ok(self.import_type(&format!("{name}&")))
    }

    /// Returns a token for the generic instantiation `generic_type<arguments>`.
    pub fn import_type_spec(&mut self, generic_type: Token, arguments: Vec<Token>) -> Token {
        if let Some(spec) = self
            .type_specs
            .iter()
            .find(|s| s.generic_type == generic_type && s.arguments == arguments)
        {
            return spec.token;
        }
        let token = next_token(self.type_specs.len(), TableId::TypeSpec);
        self.type_specs.push(TypeSpec {
            token,
            generic_type,
            arguments,
        });
        token
    }

    /// Returns a token for the generic method instantiation `method<arguments>`.
    pub fn import_method_spec(&mut self, method: Token, arguments: Vec<Token>) -> Token {
        if let Some(spec) = self
            .method_specs
            .iter()
            .find(|s| s.method == method && s.arguments == arguments)
        {
            return spec.token;
        }
        let token = next_token(self.method_specs.len(), TableId::MethodSpec);
        self.method_specs.push(MethodSpec {
            token,
            method,
            arguments,
        });
        token
    }

    /// Resolves a method of `owner`.
    ///
    /// Methods of local types must already exist; methods of referenced types are looked up among
    /// the member references and imported when missing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedMember`] when `owner` is a local type without such a method.
    pub fn import_method(&mut self, owner: Token, name: &str, signature: MethodSig) -> Result<Token> {
        if owner.table_id() == Some(TableId::TypeDef) {
            return self
                .find_method(owner, name, Some(&signature.params))
                .ok_or_else(|| self.unresolved(owner, name));
        }
        let wanted = MemberRefSig::Method(signature);
        if let Some(existing) = self
            .member_refs
            .iter()
            .find(|m| m.parent == owner && m.name == name && m.signature == wanted)
        {
            return Ok(existing.token);
        }
        Ok(self.add_member_ref(owner, name, wanted))
    }

    /// Resolves a field of `owner`, importing a member reference for external types.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedMember`] when `owner` is a local type without such a field.
    pub fn import_field(&mut self, owner: Token, name: &str) -> Result<Token> {
        if owner.table_id() == Some(TableId::TypeDef) {
            return self
                .find_field(owner, name)
                .ok_or_else(|| self.unresolved(owner, name));
        }
        if let Some(existing) = self.member_refs.iter().find(|m| {
            m.parent == owner && m.name == name && matches!(m.signature, MemberRefSig::Field(_))
        }) {
            return Ok(existing.token);
        }
        Ok(self.add_member_ref(owner, name, MemberRefSig::Field(Token::default())))
    }

    fn unresolved(&self, owner: Token, name: &str) -> Error {
        let owner = self.type_name(owner).unwrap_or_else(|| owner.to_string());
        Error::UnresolvedMember(format!("{owner}::{name}"))
    }

    /// Replaces the body of method `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenNotFound`] if `token` is not a method definition of this module.
    pub fn replace_body(&mut self, token: Token, body: MethodBody) -> Result<()> {
        if token.table_id() != Some(TableId::MethodDef)
            || token.row() == 0
            || self.omitted.contains(&token)
        {
            return Err(Error::TokenNotFound(token));
        }
        match self.methods.get_mut(token.row() as usize - 1) {
            Some(method) => {
                method.body = Some(body);
                Ok(())
            }
            None => Err(Error::TokenNotFound(token)),
        }
    }

    /// Omits method `token` from the module.
    ///
    /// The method disappears from its declaring type and from every lookup. Its row stays reserved
    /// so the tokens of the remaining methods do not shift.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenNotFound`] if `token` is not a method definition of this module.
    pub fn omit_method(&mut self, token: Token) -> Result<()> {
        let owner = self
            .method(token)
            .map(|method| method.declaring_type)
            .ok_or(Error::TokenNotFound(token))?;
        if let Some(ty) = self.type_def_mut(owner) {
            ty.methods.retain(|&m| m != token);
        }
        self.omitted.insert(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_names() {
        assert_eq!(split_type_name("System.String"), ("System", "String", ""));
        assert_eq!(
            split_type_name("System.Collections.Generic.List`1, mscorlib"),
            ("System.Collections.Generic", "List`1", "mscorlib")
        );
        assert_eq!(split_type_name("Foo"), ("", "Foo", ""));
    }

    #[test]
    fn import_type_reuses_rows() {
        let mut module = Module::new("test");
        let local = module.add_type("App", "Local");
        assert_eq!(module.import_type("App.Local"), local);

        let string = module.import_type("System.String, mscorlib");
        assert_eq!(string.table_id(), Some(TableId::TypeRef));
        assert_eq!(module.import_type("System.String"), string);
        assert_eq!(module.type_name(string).as_deref(), Some("System.String"));
    }

    #[test]
    fn import_members() {
        let mut module = Module::new("test");
        let local = module.add_type("App", "Local");
        let int32 = module.import_type("System.Int32");
        let m = module.add_method(
            local,
            "Run",
            MethodAttributes::STATIC,
            MethodSig::new_static(vec![int32], None),
            None,
        );
        let f = module.add_field(local, "count", int32, false);

        let sig = MethodSig::new_static(vec![int32], None);
        assert_eq!(module.import_method(local, "Run", sig.clone()).ok(), Some(m));
        assert!(module
            .import_method(local, "Missing", MethodSig::default())
            .is_err());
        assert_eq!(module.import_field(local, "count").ok(), Some(f));

        let console = module.import_type("System.Console");
        let write = module
            .import_method(console, "WriteLine", sig.clone())
            .expect("member ref");
        assert_eq!(write.table_id(), Some(TableId::MemberRef));
        assert_eq!(module.import_method(console, "WriteLine", sig).ok(), Some(write));
        assert_eq!(
            module.member_name(write).as_deref(),
            Some("System.Console::WriteLine")
        );
        assert_eq!(module.method_sig(write).map(|s| s.params.len()), Some(1));
    }

    #[test]
    fn user_strings_are_deduplicated() {
        let mut module = Module::new("test");
        let a = module.add_user_string("hello");
        let b = module.add_user_string("world");
        assert_ne!(a, b);
        assert_eq!(module.add_user_string("hello"), a);
        assert_eq!(module.user_string(b), Some("world"));
        assert!(module.contains(a));
    }

    #[test]
    fn by_ref_types() {
        let mut module = Module::new("test");
        let int32 = module.import_type("System.Int32");
        let by_ref = module.import_by_ref_type(int32).unwrap();
        assert_ne!(by_ref, int32);
        assert_eq!(module.type_name(by_ref).as_deref(), Some("System.Int32&"));
        assert_eq!(module.import_type("System.Int32&"), by_ref);
        assert!(module.import_by_ref_type(Token(0x0600_0001)).is_err());
    }

    #[test]
    fn generic_instantiations() {
        let mut module = Module::new("test");
        let list = module.import_type("System.Collections.Generic.List`1");
        let int32 = module.import_type("System.Int32");
        let spec = module.import_type_spec(list, vec![int32]);
        assert_eq!(module.import_type_spec(list, vec![int32]), spec);
        assert_eq!(
            module.type_name(spec).as_deref(),
            Some("System.Collections.Generic.List`1<System.Int32>")
        );
    }

    #[test]
    fn replace_body() {
        let mut module = Module::new("test");
        let ty = module.add_type("", "T");
        let m = module.add_method(ty, "M", MethodAttributes::STATIC, MethodSig::default(), None);
        assert!(module.replace_body(m, MethodBody::default()).is_ok());
        assert!(module.method(m).is_some_and(|m| m.body.is_some()));
        assert!(module.replace_body(Token(0x0600_0063), MethodBody::default()).is_err());
    }

    #[test]
    fn omitted_method_leaves_tokens_stable() {
        let mut module = Module::new("test");
        let ty = module.add_type("App", "T");
        let a = module.add_method(ty, "A", MethodAttributes::STATIC, MethodSig::default(), None);
        let b = module.add_method(ty, "B", MethodAttributes::STATIC, MethodSig::default(), None);

        module.omit_method(a).unwrap();
        assert!(module.method(a).is_none());
        assert!(!module.contains(a));
        assert_eq!(module.methods().map(|m| m.token).collect::<Vec<_>>(), vec![b]);
        assert_eq!(module.type_def(ty).unwrap().methods, vec![b]);
        assert_eq!(module.member_name(b).as_deref(), Some("App.T::B"));
        assert!(module.omit_method(a).is_err());
        assert!(module.replace_body(a, MethodBody::default()).is_err());

        let c = module.add_method(ty, "C", MethodAttributes::STATIC, MethodSig::default(), None);
        assert_ne!(c, a);
        assert_ne!(c, b);
    }
}
