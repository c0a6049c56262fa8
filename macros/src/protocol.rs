//! `Encode` and `Decode` derives.
//!
//! Both derives first turn the item into a [`Plan`]: the wire form of each
//! field and the version range it exists in, or the discriminant table of a
//! fieldless enum. Code generation then walks the plan.

use darling::{FromDeriveInput, FromField, FromMeta, FromVariant};
use proc_macro2::{Ident, TokenStream};
use quote::quote;
use syn::{spanned::Spanned, Data, DataEnum, DataStruct, DeriveInput, Fields};

#[derive(Default, Debug, FromField)]
#[darling(attributes(encoding), forward_attrs(allow, doc, cfg), default)]
struct FieldOptions {
    varint: bool,
    /// `Option` preceded by a presence flag.
    bool_prefixed: bool,
    length_prefix: Option<LengthPrefix>,
    /// First protocol version carrying the field.
    since: Option<i32>,
    /// First protocol version no longer carrying the field.
    until: Option<i32>,
}

#[derive(Debug, Clone, Copy, FromMeta)]
enum LengthPrefix {
    #[darling(rename = "varint")]
    VarInt,
    /// The list runs to the end of the packet, so it must be the last field.
    #[darling(rename = "inferred")]
    Inferred,
}

#[derive(Debug, FromDeriveInput)]
#[darling(attributes(encoding), forward_attrs(allow, doc, cfg))]
struct EnumOptions {
    discriminant: Discriminant,
}

#[derive(Debug, Clone, Copy, FromMeta)]
enum Discriminant {
    #[darling(rename = "varint")]
    VarInt,
    #[darling(rename = "byte")]
    Byte,
}

#[derive(Debug, FromVariant)]
#[darling(attributes(encoding), forward_attrs(allow, doc, cfg))]
struct VariantOptions {
    id: i64,
}

/// How a field's value is laid out on the wire.
#[derive(Debug, Clone, Copy)]
enum Wire {
    /// The field type's own `Encode`/`Decode`.
    Plain,
    VarInt,
    BoolPrefixed,
    List(LengthPrefix),
}

/// The protocol versions a field is present in.
#[derive(Debug, Clone, Copy)]
struct Gate {
    since: Option<i32>,
    until: Option<i32>,
}

struct Field {
    ident: Ident,
    wire: Wire,
    gate: Option<Gate>,
}

enum Plan {
    Struct(Vec<Field>),
    Enum {
        discriminant: Discriminant,
        variants: Vec<(Ident, i64)>,
    },
}

impl FieldOptions {
    fn wire(&self, span: proc_macro2::Span) -> syn::Result<Wire> {
        match (self.varint, self.bool_prefixed, self.length_prefix) {
            (false, false, None) => Ok(Wire::Plain),
            (true, false, None) => Ok(Wire::VarInt),
            (false, true, None) => Ok(Wire::BoolPrefixed),
            (false, false, Some(prefix)) => Ok(Wire::List(prefix)),
            _ => Err(syn::Error::new(
                span,
                "`varint`, `bool_prefixed` and `length_prefix` are mutually exclusive",
            )),
        }
    }

    fn gate(&self) -> Option<Gate> {
        (self.since.is_some() || self.until.is_some()).then_some(Gate {
            since: self.since,
            until: self.until,
        })
    }
}

impl Gate {
    /// Whether the version of `source` (an encoder or decoder) carries the field.
    fn condition(self, source: TokenStream) -> TokenStream {
        let bound = |version: Option<i32>| match version {
            Some(v) => quote!(::std::option::Option::Some(#v)),
            None => quote!(::std::option::Option::None),
        };
        let (since, until) = (bound(self.since), bound(self.until));
        quote!(#source.version().in_range(#since, #until))
    }
}

impl Wire {
    fn write(self, value: &TokenStream) -> TokenStream {
        match self {
            Wire::Plain => quote! {
                crate::protocol::Encode::encode(&#value, encoder);
            },
            Wire::VarInt => quote! {
                encoder.write_var_int(#value.try_into().unwrap_or(i32::MAX));
            },
            Wire::BoolPrefixed => quote! {
                encoder.write_bool(#value.is_some());
                if let ::std::option::Option::Some(present) = &#value {
                    crate::protocol::Encode::encode(present, encoder);
                }
            },
            Wire::List(prefix) => {
                let length = match prefix {
                    LengthPrefix::VarInt => quote! {
                        encoder.write_var_int(#value.len().try_into().unwrap_or(i32::MAX));
                    },
                    LengthPrefix::Inferred => TokenStream::new(),
                };
                quote! {
                    #length
                    for item in &#value {
                        crate::protocol::Encode::encode(item, encoder);
                    }
                }
            }
        }
    }

    fn read(self) -> TokenStream {
        match self {
            Wire::Plain => quote!(crate::protocol::Decode::decode(decoder)?),
            Wire::VarInt => quote!(decoder.read_var_int()?.try_into()?),
            Wire::BoolPrefixed => quote! {
                match decoder.read_bool()? {
                    true => ::std::option::Option::Some(crate::protocol::Decode::decode(decoder)?),
                    false => ::std::option::Option::None,
                }
            },
            Wire::List(LengthPrefix::VarInt) => quote! {{
                let count = usize::try_from(decoder.read_var_int()?)?;
                // Never trust the prefix for more than the bytes actually present.
                let mut items = Vec::with_capacity(count.min(decoder.buffer().len()));
                for _ in 0..count {
                    items.push(crate::protocol::Decode::decode(decoder)?);
                }
                items
            }},
            Wire::List(LengthPrefix::Inferred) => quote! {{
                let mut items = Vec::new();
                while !decoder.is_finished() {
                    items.push(crate::protocol::Decode::decode(decoder)?);
                }
                items
            }},
        }
    }
}

fn plan(input: &DeriveInput) -> syn::Result<Plan> {
    match &input.data {
        Data::Struct(data) => plan_struct(data).map(Plan::Struct),
        Data::Enum(data) => plan_enum(data, input),
        Data::Union(data) => Err(syn::Error::new_spanned(
            data.union_token,
            "Encode/Decode cannot be derived for unions",
        )),
    }
}

fn plan_struct(data: &DataStruct) -> syn::Result<Vec<Field>> {
    let named = match &data.fields {
        Fields::Named(named) => &named.named,
        Fields::Unit => return Ok(Vec::new()),
        Fields::Unnamed(unnamed) => {
            return Err(syn::Error::new_spanned(
                unnamed,
                "packet fields must be named",
            ))
        }
    };
    named
        .iter()
        .filter_map(|field| field.ident.clone().map(|ident| (ident, field)))
        .map(|(ident, field)| {
            let options = FieldOptions::from_field(field)?;
            Ok(Field {
                wire: options.wire(field.span())?,
                gate: options.gate(),
                ident,
            })
        })
        .collect()
}

fn plan_enum(data: &DataEnum, input: &DeriveInput) -> syn::Result<Plan> {
    let discriminant = EnumOptions::from_derive_input(input)?.discriminant;
    let mut variants = Vec::with_capacity(data.variants.len());
    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(syn::Error::new_spanned(
                &variant.fields,
                "only fieldless variants can be encoded",
            ));
        }
        let id = VariantOptions::from_variant(variant)?.id;
        let fits = match discriminant {
            Discriminant::Byte => u8::try_from(id).is_ok(),
            Discriminant::VarInt => i32::try_from(id).is_ok(),
        };
        if !fits {
            return Err(syn::Error::new_spanned(
                &variant.ident,
                "id does not fit the discriminant",
            ));
        }
        variants.push((variant.ident.clone(), id));
    }
    Ok(Plan::Enum {
        discriminant,
        variants,
    })
}

fn encode_body(plan: &Plan) -> TokenStream {
    match plan {
        Plan::Struct(fields) => {
            let writes = fields.iter().map(|field| {
                let ident = &field.ident;
                let write = field.wire.write(&quote!(self.#ident));
                match field.gate {
                    Some(gate) => {
                        let present = gate.condition(quote!(encoder));
                        quote!(if #present { #write })
                    }
                    None => write,
                }
            });
            quote!(#(#writes)*)
        }
        Plan::Enum {
            discriminant,
            variants,
        } => {
            let arms = variants.iter().map(|(ident, id)| {
                // Ranges were checked while planning.
                let write = match discriminant {
                    Discriminant::Byte => {
                        let id = *id as u8;
                        quote!(encoder.write_u8(#id))
                    }
                    Discriminant::VarInt => {
                        let id = *id as i32;
                        quote!(encoder.write_var_int(#id))
                    }
                };
                quote!(Self::#ident => { #write; })
            });
            quote!(match self { #(#arms)* })
        }
    }
}

fn decode_body(plan: &Plan) -> TokenStream {
    match plan {
        Plan::Struct(fields) => {
            let reads = fields.iter().map(|field| {
                let ident = &field.ident;
                let read = field.wire.read();
                match field.gate {
                    Some(gate) => {
                        let present = gate.condition(quote!(decoder));
                        quote! {
                            let #ident = if #present {
                                #read
                            } else {
                                ::std::default::Default::default()
                            };
                        }
                    }
                    None => quote!(let #ident = #read;),
                }
            });
            let idents = fields.iter().map(|field| &field.ident);
            quote! {
                #(#reads)*
                Ok(Self { #(#idents,)* })
            }
        }
        Plan::Enum {
            discriminant,
            variants,
        } => {
            let read = match discriminant {
                Discriminant::VarInt => quote!(i64::from(decoder.read_var_int()?)),
                Discriminant::Byte => quote!(i64::from(decoder.read_u8()?)),
            };
            let arms = variants
                .iter()
                .map(|(ident, id)| quote!(#id => Ok(Self::#ident),));
            quote! {
                match #read {
                    #(#arms)*
                    other => Err(crate::protocol::DecodeError::InvalidDiscriminant(other)),
                }
            }
        }
    }
}

pub fn derive_encode_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let body = encode_body(&plan(input)?);
    let ident = &input.ident;
    Ok(quote! {
        impl crate::protocol::Encode for #ident {
            fn encode(&self, encoder: &mut crate::protocol::Encoder) {
                #body
            }
        }
    })
}

pub fn derive_decode_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let body = decode_body(&plan(input)?);
    let ident = &input.ident;
    Ok(quote! {
        impl crate::protocol::Decode for #ident {
            fn decode(
                decoder: &mut crate::protocol::Decoder,
            ) -> ::std::result::Result<Self, crate::protocol::DecodeError> {
                #body
            }
        }
    })
}
