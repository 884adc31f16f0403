//! 轻量 XML 树
//!
//! 网关返回的 XML 体量很小，这里把 quick-xml 的事件流收拢成一棵只保留
//! 本地名 (去掉命名空间前缀) 的元素树，便于按名字查找字段

use crate::nat::MappingError;
use quick_xml::events::Event;
use quick_xml::Reader;

/// XML 元素
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    /// 本地名 (不含前缀)
    pub name: String,
    /// 直接文本内容
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// 解析 XML 文本，返回根元素
    pub fn parse(input: &str) -> Result<XmlElement, MappingError> {
        let mut reader = Reader::from_str(input);
        reader.trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    stack.push(XmlElement {
                        name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                        ..Default::default()
                    });
                }
                Event::Empty(e) => {
                    let element = XmlElement {
                        name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                        ..Default::default()
                    };
                    attach(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| MappingError::decode("unbalanced closing tag"))?;
                    attach(&mut stack, &mut root, element);
                }
                Event::Text(t) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&t.unescape()?);
                    }
                }
                Event::CData(c) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(MappingError::decode("unexpected end of document"));
        }
        root.ok_or_else(|| MappingError::decode("empty document"))
    }

    /// 第一个同名子元素
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// 子元素文本 (已去除首尾空白)
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.trim())
    }

    /// 深度优先查找第一个同名元素 (包括自身)
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// 深度优先收集所有同名元素
    pub fn find_all<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlElement>) {
        if self.name == name {
            out.push(self);
        }
        for child in &self.children {
            child.find_all(name, out);
        }
    }
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}
